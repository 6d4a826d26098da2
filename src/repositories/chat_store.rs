use std::future::Future;
use std::pin::Pin;

use crate::models::message::{Conversation, Message};
use crate::models::provider_config::ProviderConfig;

use super::error::StoreResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persisted-store collaborator boundary.
///
/// The orchestration engine consumes this contract and does not interpret
/// `StoreError` diagnostics beyond surfacing them. `append_message` bumps the
/// owning conversation's `updated_at` as a side effect; `delete_conversation`
/// cascades to its messages. `update_message` exists for the image flow,
/// which persists its placeholder up front and rewrites it in place once the
/// image resolves.
pub trait ChatStore: Send + Sync + 'static {
    /// Conversations owned by `user`, most recently active first.
    fn list_conversations(&self, user: &str) -> BoxFuture<'static, StoreResult<Vec<Conversation>>>;

    fn create_conversation(
        &self,
        user: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>>;

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Delete a conversation and all of its messages.
    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Messages of one conversation, ordered by creation ascending.
    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Message>>>;

    fn append_message(&self, message: Message) -> BoxFuture<'static, StoreResult<Message>>;

    /// Replace the content/image payload of an existing message.
    fn update_message(
        &self,
        id: &str,
        content: &str,
        image: Option<&str>,
    ) -> BoxFuture<'static, StoreResult<()>>;

    fn delete_message(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;

    fn list_provider_configs(
        &self,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<ProviderConfig>>>;

    fn upsert_provider_config(
        &self,
        config: ProviderConfig,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<ProviderConfig>>;

    fn delete_provider_config(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;
}
