use anyhow::Result;
use tracing::debug;

use super::adapter::ChatAdapter;

/// Truncate text to max length
fn truncate_text(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

/// Clean and validate a generated title
pub(crate) fn clean_title(raw_title: &str) -> String {
    let cleaned = raw_title
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .lines()
        .next()
        .unwrap_or("New Chat")
        .to_string();

    if cleaned.chars().count() > 100 {
        let head: String = cleaned.chars().take(97).collect();
        format!("{head}...")
    } else if cleaned.is_empty() {
        "New Chat".to_string()
    } else {
        cleaned
    }
}

/// Generate a concise title for a conversation based on the first exchange.
///
/// Best-effort: callers log failures and keep the derived default title.
pub async fn generate_title(
    adapter: &ChatAdapter,
    user_text: &str,
    assistant_text: &str,
) -> Result<String> {
    let title_prompt = format!(
        "Generate a concise, descriptive title (3-7 words) for this conversation. \
        Output ONLY the title, no quotes, no explanation.\n\n\
        User: {}\n\nAssistant: {}",
        truncate_text(user_text, 500),
        truncate_text(assistant_text, 500)
    );

    let response_text = adapter.prompt(&title_prompt).await?;
    debug!(response = %response_text, "Title response received");

    Ok(clean_title(&response_text))
}
