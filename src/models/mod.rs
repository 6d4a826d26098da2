pub mod message;
pub mod provider_config;
pub mod streaming_session;
pub mod transcript;
