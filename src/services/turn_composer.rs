use tracing::{debug, warn};

use crate::models::message::{Message, Role};

use super::attachment_encoder::{self, EncodedAttachment};
use super::generative_client::{Part, TurnPayload};

/// Model-facing role tag. `assistant` maps to the provider's "model" role;
/// both `user` and `system` map to "user".
pub(crate) fn role_tag(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    }
}

/// A provider request in two pieces: the prior role-tagged turns and the
/// content block for the newest user turn.
#[derive(Debug, Clone)]
pub struct ComposedRequest {
    pub prior_turns: Vec<TurnPayload>,
    pub current_parts: Vec<Part>,
}

impl ComposedRequest {
    /// Flatten into the ordered turn sequence sent to the provider.
    pub fn into_contents(self) -> Vec<TurnPayload> {
        let mut contents = self.prior_turns;
        contents.push(TurnPayload {
            role: "user".to_string(),
            parts: self.current_parts,
        });
        contents
    }
}

/// Compose the provider request for one send.
///
/// `history` is ordered oldest→newest and excludes `current`. Each historical
/// message becomes a role-tagged multi-part turn: text part first, then its
/// attachments in original order. A failed historical attachment is omitted
/// and never aborts the request; a failed current attachment degrades the
/// turn to text only. `fresh_attachment` (the just-added file, already in
/// memory) takes precedence over any reference recorded on `current`, so the
/// same resource is never fetched twice.
pub async fn compose(
    history: &[Message],
    current: &Message,
    fresh_attachment: Option<EncodedAttachment>,
    http: &reqwest::Client,
) -> ComposedRequest {
    let mut prior_turns = Vec::with_capacity(history.len());

    for message in history {
        let mut parts = Vec::new();
        if !message.content.is_empty() {
            parts.push(Part::text(&message.content));
        }
        for reference in &message.attachments {
            match attachment_encoder::encode(reference, http).await {
                Ok(Some(encoded)) => {
                    parts.push(Part::inline(&encoded.mime_type, encoded.base64_data()));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Skipping unresolvable historical attachment");
                }
            }
        }
        if parts.is_empty() {
            debug!(message = %message.id, "Skipping historical message with no sendable parts");
            continue;
        }
        prior_turns.push(TurnPayload {
            role: role_tag(message.role).to_string(),
            parts,
        });
    }

    let mut current_parts = Vec::new();
    if !current.content.is_empty() {
        current_parts.push(Part::text(&current.content));
    }

    if let Some(encoded) = fresh_attachment {
        current_parts.push(Part::inline(&encoded.mime_type, encoded.base64_data()));
    } else {
        for reference in &current.attachments {
            match attachment_encoder::encode(reference, http).await {
                Ok(Some(encoded)) => {
                    current_parts.push(Part::inline(&encoded.mime_type, encoded.base64_data()));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Current attachment unresolvable, sending text only");
                }
            }
        }
    }

    if current_parts.is_empty() {
        current_parts.push(Part::text(""));
    }

    ComposedRequest {
        prior_turns,
        current_parts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::attachment_encoder::to_data_uri;

    fn part_text(part: &Part) -> Option<&str> {
        match part {
            Part::Text { text } => Some(text),
            Part::InlineData { .. } => None,
        }
    }

    fn is_inline(part: &Part) -> bool {
        matches!(part, Part::InlineData { .. })
    }

    #[tokio::test]
    async fn test_empty_history_single_text_part() {
        let http = reqwest::Client::new();
        let current = Message::user("c1", "Hello", Vec::new());

        let composed = compose(&[], &current, None, &http).await;

        assert!(composed.prior_turns.is_empty());
        assert_eq!(composed.current_parts.len(), 1);
        assert_eq!(part_text(&composed.current_parts[0]), Some("Hello"));
    }

    #[tokio::test]
    async fn test_order_and_role_mapping_preserved() {
        let http = reqwest::Client::new();
        let history = vec![
            Message::user("c1", "first question", Vec::new()),
            Message::assistant_text("c1", "first answer"),
            Message {
                role: Role::System,
                ..Message::user("c1", "note", Vec::new())
            },
        ];
        let current = Message::user("c1", "second question", Vec::new());

        let composed = compose(&history, &current, None, &http).await;

        let roles: Vec<&str> = composed
            .prior_turns
            .iter()
            .map(|t| t.role.as_str())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);

        let contents = composed.into_contents();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[3].role, "user");
        assert_eq!(part_text(&contents[0].parts[0]), Some("first question"));
        assert_eq!(part_text(&contents[1].parts[0]), Some("first answer"));
    }

    #[tokio::test]
    async fn test_inline_history_attachment_becomes_part() {
        let http = reqwest::Client::new();
        let uri = to_data_uri("image/jpeg", &[0xFF, 0xD8]);
        let history = vec![Message::user("c1", "look at this", vec![uri])];
        let current = Message::user("c1", "and?", Vec::new());

        let composed = compose(&history, &current, None, &http).await;

        assert_eq!(composed.prior_turns.len(), 1);
        let parts = &composed.prior_turns[0].parts;
        assert_eq!(parts.len(), 2);
        assert_eq!(part_text(&parts[0]), Some("look at this"));
        assert!(is_inline(&parts[1]));
    }

    #[tokio::test]
    async fn test_failed_history_attachment_does_not_abort() {
        let http = reqwest::Client::new();
        let history = vec![Message::user(
            "c1",
            "broken link here",
            vec!["http://127.0.0.1:1/gone.png".to_string()],
        )];
        let current = Message::user("c1", "continue anyway", Vec::new());

        let composed = compose(&history, &current, None, &http).await;

        // The turn survives with its text part; the attachment is omitted.
        assert_eq!(composed.prior_turns.len(), 1);
        assert_eq!(composed.prior_turns[0].parts.len(), 1);
        assert_eq!(
            part_text(&composed.current_parts[0]),
            Some("continue anyway")
        );
    }

    #[tokio::test]
    async fn test_fresh_attachment_takes_precedence() {
        let http = reqwest::Client::new();
        // The recorded reference would fail to fetch; the fresh payload must
        // be used instead, without touching the network.
        let current = Message::user(
            "c1",
            "see attached",
            vec!["http://127.0.0.1:1/slow.png".to_string()],
        );
        let fresh = EncodedAttachment {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        };

        let composed = compose(&[], &current, Some(fresh), &http).await;

        assert_eq!(composed.current_parts.len(), 2);
        assert!(is_inline(&composed.current_parts[1]));
    }

    #[tokio::test]
    async fn test_failed_current_attachment_degrades_to_text() {
        let http = reqwest::Client::new();
        let current = Message::user(
            "c1",
            "still send me",
            vec!["http://127.0.0.1:1/gone.png".to_string()],
        );

        let composed = compose(&[], &current, None, &http).await;

        assert_eq!(composed.current_parts.len(), 1);
        assert_eq!(part_text(&composed.current_parts[0]), Some("still send me"));
    }
}
