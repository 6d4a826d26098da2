use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::message::{Conversation, Message, now_ts};
use crate::models::provider_config::ProviderConfig;

use super::chat_store::{BoxFuture, ChatStore};
use super::error::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    /// Kept in insertion order so equal timestamps stay stable.
    messages: Vec<Message>,
    configs: HashMap<String, (String, ProviderConfig)>,
}

/// In-memory store for tests and development.
#[derive(Clone, Default)]
pub struct MemoryChatStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatStore for MemoryChatStore {
    fn list_conversations(&self, user: &str) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        let inner = self.inner.clone();
        let user = user.to_string();
        Box::pin(async move {
            let store = inner.lock();
            let mut result: Vec<Conversation> = store
                .conversations
                .values()
                .filter(|c| c.user == user)
                .cloned()
                .collect();
            result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(result)
        })
    }

    fn create_conversation(
        &self,
        user: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>> {
        let inner = self.inner.clone();
        let conversation = Conversation::new(user, title);
        Box::pin(async move {
            inner
                .lock()
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        let title = title.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            let conversation = store
                .conversations
                .get_mut(&id)
                .ok_or(StoreError::NotFound { id })?;
            conversation.title = title;
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut store = inner.lock();
            store.conversations.remove(&id);
            store.messages.retain(|m| m.conversation_id != id);
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let inner = self.inner.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let store = inner.lock();
            let mut result: Vec<Message> = store
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect();
            result.sort_by_key(|m| m.created_at);
            Ok(result)
        })
    }

    fn append_message(&self, message: Message) -> BoxFuture<'static, StoreResult<Message>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut store = inner.lock();
            if let Some(conversation) = store.conversations.get_mut(&message.conversation_id) {
                conversation.updated_at = now_ts().max(conversation.updated_at + 1);
            }
            store.messages.push(message.clone());
            Ok(message)
        })
    }

    fn update_message(
        &self,
        id: &str,
        content: &str,
        image: Option<&str>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        let content = content.to_string();
        let image = image.map(str::to_string);
        Box::pin(async move {
            let mut store = inner.lock();
            let message = store
                .messages
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(StoreError::NotFound { id })?;
            message.content = content;
            message.image = image;
            Ok(())
        })
    }

    fn delete_message(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        Box::pin(async move {
            inner.lock().messages.retain(|m| m.id != id);
            Ok(())
        })
    }

    fn list_provider_configs(
        &self,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<ProviderConfig>>> {
        let inner = self.inner.clone();
        let user = user.to_string();
        Box::pin(async move {
            let store = inner.lock();
            let mut result: Vec<ProviderConfig> = store
                .configs
                .values()
                .filter(|(owner, _)| *owner == user)
                .map(|(_, config)| config.clone())
                .collect();
            result.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(result)
        })
    }

    fn upsert_provider_config(
        &self,
        config: ProviderConfig,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<ProviderConfig>> {
        let inner = self.inner.clone();
        let user = user.to_string();
        Box::pin(async move {
            inner
                .lock()
                .configs
                .insert(config.id.clone(), (user, config.clone()));
            Ok(config)
        })
    }

    fn delete_provider_config(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        Box::pin(async move {
            inner.lock().configs.remove(&id);
            Ok(())
        })
    }
}
