use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A persisted conversation message.
///
/// An assistant turn carries exactly one primary payload: either `content`
/// (generated text) or `image` (an inline reference to a generated image).
/// `attachments` holds ordered references (data URIs or URLs) and appears only
/// on user turns in normal flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub created_at: i64,
}

impl Message {
    /// Build a user message with optional attachment references.
    pub fn user(conversation_id: &str, content: &str, attachments: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            image: None,
            attachments,
            created_at: now_ts(),
        }
    }

    /// Build an assistant message whose primary payload is text.
    pub fn assistant_text(conversation_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            image: None,
            attachments: Vec::new(),
            created_at: now_ts(),
        }
    }

    /// Build an assistant message whose primary payload is a generated image.
    pub fn assistant_image(conversation_id: &str, image: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content: String::new(),
            image: Some(image.to_string()),
            attachments: Vec::new(),
            created_at: now_ts(),
        }
    }
}

/// A persisted conversation.
///
/// `updated_at` is a monotonic last-activity marker bumped on every message
/// append. It is used for ordering only, never for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(user: &str, title: &str) -> Self {
        let now = now_ts();
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive a conversation title from the opening user text.
pub fn title_from_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "New Chat".to_string();
    }
    let title: String = trimmed.chars().take(48).collect();
    if title.len() < trimmed.len() {
        format!("{}…", title.trim_end())
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("model"), None);
    }

    #[test]
    fn test_assistant_payloads_are_exclusive() {
        let text = Message::assistant_text("c1", "hello");
        assert!(text.image.is_none());

        let image = Message::assistant_image("c1", "data:image/png;base64,AA==");
        assert!(image.content.is_empty());
        assert!(image.image.is_some());
    }

    #[test]
    fn test_title_from_text_truncates() {
        assert_eq!(title_from_text("  "), "New Chat");
        assert_eq!(title_from_text("Short question"), "Short question");
        let long = "a".repeat(100);
        let title = title_from_text(&long);
        assert!(title.chars().count() <= 49);
        assert!(title.ends_with('…'));
    }
}
