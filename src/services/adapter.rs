use std::collections::HashMap;

use tracing::warn;

use crate::models::provider_config::{ImageRoute, ProviderCategory, ProviderConfig};

use super::generative_client::{
    CancelFlag, GenerateError, GenerativeClient, InlineImage, ResponseStream,
};
use super::turn_composer::ComposedRequest;

/// Streaming chat capability.
#[derive(Clone)]
pub struct ChatAdapter {
    client: GenerativeClient,
}

impl ChatAdapter {
    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub async fn stream(&self, composed: ComposedRequest, cancel: CancelFlag) -> ResponseStream {
        self.client.chat_stream(composed, cancel).await
    }

    pub async fn prompt(&self, text: &str) -> Result<String, GenerateError> {
        self.client.prompt(text).await
    }
}

/// Single-shot image generation capability.
#[derive(Clone)]
pub struct ImageAdapter {
    client: GenerativeClient,
    route: ImageRoute,
}

impl ImageAdapter {
    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub async fn generate(&self, prompt: &str) -> Result<InlineImage, GenerateError> {
        self.client.generate_image(prompt, self.route).await
    }
}

/// A provider configuration resolved into its capability.
///
/// The configuration's category alone selects the variant; there is no
/// per-request override.
#[derive(Clone)]
pub enum ModelAdapter {
    Chat(ChatAdapter),
    Image(ImageAdapter),
}

impl ModelAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, GenerateError> {
        let client = GenerativeClient::from_config(config)?;
        Ok(match config.category {
            ProviderCategory::Chat => ModelAdapter::Chat(ChatAdapter { client }),
            ProviderCategory::Image => ModelAdapter::Image(ImageAdapter {
                client,
                route: config.resolved_image_route(),
            }),
        })
    }

    pub fn category(&self) -> ProviderCategory {
        match self {
            ModelAdapter::Chat(_) => ProviderCategory::Chat,
            ModelAdapter::Image(_) => ProviderCategory::Image,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ModelAdapter::Chat(adapter) => adapter.model(),
            ModelAdapter::Image(adapter) => adapter.model(),
        }
    }
}

/// Adapters keyed by provider configuration id.
///
/// Built once at startup from the active configurations and passed by
/// reference to the orchestrator; there is no lazily initialized process-wide
/// instance.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, ModelAdapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.active) {
            match ModelAdapter::from_config(config) {
                Ok(adapter) => {
                    registry.adapters.insert(config.id.clone(), adapter);
                }
                Err(e) => {
                    warn!(config = %config.name, error = %e, "Skipping unusable provider configuration");
                }
            }
        }
        registry
    }

    pub fn get(&self, config_id: &str) -> Option<&ModelAdapter> {
        self.adapters.get(config_id)
    }

    pub fn insert(&mut self, config_id: &str, adapter: ModelAdapter) {
        self.adapters.insert(config_id.to_string(), adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_skips_inactive_configs() {
        let mut inactive = ProviderConfig::new("Off", ProviderCategory::Chat, "gemini-2.0-flash");
        inactive.active = false;
        let active = ProviderConfig::new("On", ProviderCategory::Chat, "gemini-2.0-flash");

        let registry = AdapterRegistry::from_configs(&[inactive.clone(), active.clone()]);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&inactive.id).is_none());
        assert!(registry.get(&active.id).is_some());
    }

    #[test]
    fn test_category_selects_capability() {
        let chat = ProviderConfig::new("Chat", ProviderCategory::Chat, "gemini-2.0-flash");
        let image = ProviderConfig::new("Image", ProviderCategory::Image, "imagen-3.0-generate-002");

        let registry = AdapterRegistry::from_configs(&[chat.clone(), image.clone()]);

        assert_eq!(
            registry.get(&chat.id).unwrap().category(),
            ProviderCategory::Chat
        );
        assert_eq!(
            registry.get(&image.id).unwrap().category(),
            ProviderCategory::Image
        );
    }
}
