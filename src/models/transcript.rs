use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::message::{Message, Role};

/// Two-phase message identity.
///
/// A placeholder created during generation carries a `Local` handle; after
/// reconciliation the entry is replaced wholesale by one with the canonical
/// `Persisted` id. A local id is never written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryId {
    Local(Uuid),
    Persisted(String),
}

/// One visible transcript entry.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub role: Role,
    pub content: String,
    pub image: Option<String>,
    pub attachments: Vec<String>,
    /// True while the entry is awaiting generation or reconciliation.
    pub pending: bool,
}

impl TranscriptEntry {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: EntryId::Persisted(message.id.clone()),
            role: message.role,
            content: message.content.clone(),
            image: message.image.clone(),
            attachments: message.attachments.clone(),
            pending: false,
        }
    }

    /// An empty optimistic assistant placeholder.
    pub fn placeholder(local_id: Uuid) -> Self {
        Self {
            id: EntryId::Local(local_id),
            role: Role::Assistant,
            content: String::new(),
            image: None,
            attachments: Vec::new(),
            pending: true,
        }
    }
}

/// The UI-visible message list for the active conversation.
///
/// Mutated only by whole-list transformation; observers take owned snapshots
/// and never see a partially applied edit.
#[derive(Clone, Default)]
pub struct Transcript {
    entries: Arc<RwLock<Vec<TranscriptEntry>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replace the whole list with the canonical persisted messages.
    pub fn replace_with_messages(&self, messages: &[Message]) {
        let entries = messages.iter().map(TranscriptEntry::from_message).collect();
        *self.entries.write() = entries;
    }

    /// Apply a full-list transformation.
    pub fn transform(&self, f: impl FnOnce(Vec<TranscriptEntry>) -> Vec<TranscriptEntry>) {
        let mut guard = self.entries.write();
        let current = std::mem::take(&mut *guard);
        *guard = f(current);
    }

    pub fn append(&self, entry: TranscriptEntry) {
        self.transform(|mut entries| {
            entries.push(entry);
            entries
        });
    }

    /// Set the content of the entry with the given id, leaving it pending.
    pub fn set_content(&self, id: &EntryId, content: &str) {
        self.transform(|entries| {
            entries
                .into_iter()
                .map(|mut entry| {
                    if entry.id == *id {
                        entry.content = content.to_string();
                    }
                    entry
                })
                .collect()
        });
    }

    pub fn find(&self, id: &EntryId) -> Option<TranscriptEntry> {
        self.entries.read().iter().find(|e| e.id == *id).cloned()
    }
}
