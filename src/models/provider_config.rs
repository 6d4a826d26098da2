use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which adapter capability a provider configuration selects.
///
/// The category alone decides whether a send is dispatched as a streaming
/// chat request or a single-shot image generation; there is no per-request
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Chat,
    Image,
}

impl ProviderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCategory::Chat => "chat",
            ProviderCategory::Image => "image",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(ProviderCategory::Chat),
            "image" => Some(ProviderCategory::Image),
            _ => None,
        }
    }
}

/// Execution path for image-capable configurations.
///
/// `Dedicated` models use the standalone prediction endpoint; `Multimodal`
/// models answer on the general content endpoint and the response is
/// inspected for an inline image part. The route is fixed when the
/// configuration is saved, never inferred again at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRoute {
    Dedicated,
    Multimodal,
}

impl ImageRoute {
    /// One-time inference from the model identifier, applied when a
    /// configuration is created without an explicit route.
    pub fn infer(model: &str) -> Self {
        if model.to_ascii_lowercase().contains("imagen") {
            ImageRoute::Dedicated
        } else {
            ImageRoute::Multimodal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageRoute::Dedicated => "dedicated",
            ImageRoute::Multimodal => "multimodal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dedicated" => Some(ImageRoute::Dedicated),
            "multimodal" => Some(ImageRoute::Multimodal),
            _ => None,
        }
    }
}

/// A provider/model configuration.
///
/// Read-only to the orchestration engine; owned and edited by an external
/// administrative surface through the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub category: ProviderCategory,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub active: bool,
    /// Present only for `Image` configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_route: Option<ImageRoute>,
}

impl ProviderConfig {
    pub fn new(name: &str, category: ProviderCategory, model: &str) -> Self {
        let image_route = match category {
            ProviderCategory::Image => Some(ImageRoute::infer(model)),
            ProviderCategory::Chat => None,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            category,
            model: model.to_string(),
            api_key: None,
            base_url: None,
            active: true,
            image_route,
        }
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn with_image_route(mut self, route: ImageRoute) -> Self {
        self.image_route = Some(route);
        self
    }

    /// Route used by image dispatch, falling back to one-time inference for
    /// configurations persisted before the tag existed.
    pub fn resolved_image_route(&self) -> ImageRoute {
        self.image_route.unwrap_or_else(|| ImageRoute::infer(&self.model))
    }
}
