use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::message::{Conversation, Message, title_from_text};
use crate::models::streaming_session::StreamingSession;
use crate::models::transcript::Transcript;
use crate::repositories::blob_store::BlobStore;
use crate::repositories::chat_store::ChatStore;
use crate::repositories::error::StoreError;

use super::adapter::{AdapterRegistry, ChatAdapter, ImageAdapter, ModelAdapter};
use super::attachment_encoder::{EncodedAttachment, to_data_uri};
use super::generative_client::{CancelFlag, ResponseStream, StreamChunk};
use super::reconciler::TranscriptReconciler;
use super::title;
use super::turn_composer;

/// Gate key for a send whose conversation does not exist yet.
const PENDING_CONVERSATION: &str = "__pending__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Chat,
    Image,
}

/// Phase of an in-flight send, for observation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    AttachmentUploading,
    UserMessagePersisted,
    Dispatched(DispatchKind),
    Reconciling,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("A send is already in flight for this conversation")]
    SendInFlight,

    #[error("No active provider configuration '{config_id}'")]
    UnknownAdapter { config_id: String },

    #[error("Conversation '{conversation_id}' not found")]
    UnknownConversation { conversation_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A file the user attached to the outgoing turn.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// One user send action.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub user: String,
    /// `None` creates a conversation lazily on this first send.
    pub conversation_id: Option<String>,
    pub provider_config_id: String,
    pub text: String,
    pub file: Option<OutgoingFile>,
}

/// How the assistant turn ended. `Failed` is not an error of `send` itself:
/// the failure is already reflected in the transcript (and, for image mode,
/// in the store), so the user turn is never silently dropped.
#[derive(Debug)]
pub enum ReplyStatus {
    Completed(Message),
    Failed(String),
}

#[derive(Debug)]
pub struct SendOutcome {
    pub conversation_id: String,
    pub user_message: Message,
    pub reply: ReplyStatus,
}

struct InFlight {
    cancel: CancelFlag,
    phase: Arc<Mutex<SendPhase>>,
}

/// Per-conversation single-flight gate.
///
/// At most one orchestrated send per conversation; a second attempt fails
/// fast instead of interleaving with the first. A send without a conversation
/// holds the pending key until the conversation is created, then promotes.
#[derive(Clone, Default)]
struct SendGate {
    inner: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl SendGate {
    fn try_acquire(&self, key: &str) -> Option<SendGuard> {
        let mut map = self.inner.lock();
        if map.contains_key(key) {
            return None;
        }
        let entry = InFlight {
            cancel: CancelFlag::new(),
            phase: Arc::new(Mutex::new(SendPhase::Idle)),
        };
        let cancel = entry.cancel.clone();
        let phase = entry.phase.clone();
        map.insert(key.to_string(), entry);
        Some(SendGuard {
            gate: self.clone(),
            key: key.to_string(),
            cancel,
            phase,
        })
    }

    fn cancel(&self, key: &str) -> bool {
        match self.inner.lock().get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn is_in_flight(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    fn phase(&self, key: &str) -> SendPhase {
        self.inner
            .lock()
            .get(key)
            .map(|entry| *entry.phase.lock())
            .unwrap_or(SendPhase::Idle)
    }
}

struct SendGuard {
    gate: SendGate,
    key: String,
    cancel: CancelFlag,
    phase: Arc<Mutex<SendPhase>>,
}

impl SendGuard {
    fn set_phase(&self, phase: SendPhase) {
        *self.phase.lock() = phase;
    }

    /// Move the gate entry from the pending key to the created conversation.
    fn promote(&mut self, conversation_id: &str) {
        let mut map = self.gate.inner.lock();
        if let Some(entry) = map.remove(&self.key) {
            map.insert(conversation_id.to_string(), entry);
        }
        self.key = conversation_id.to_string();
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.gate.inner.lock().remove(&self.key);
    }
}

/// Terminal outcome of driving one response stream.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Consume a response stream, folding fragments into the placeholder.
///
/// Exactly one outcome per invocation; a set cancel flag stops consumption
/// before the next chunk is applied.
pub(crate) async fn drive_chat_stream(
    mut stream: ResponseStream,
    reconciler: &TranscriptReconciler,
    session: &mut StreamingSession,
    cancel: &CancelFlag,
) -> StreamOutcome {
    while let Some(item) = stream.next().await {
        if cancel.is_cancelled() {
            debug!("Send cancelled, abandoning stream");
            return StreamOutcome::Cancelled;
        }
        match item {
            Ok(StreamChunk::Text(text)) => reconciler.apply_chunk(session, &text),
            Ok(StreamChunk::Done) => return StreamOutcome::Completed,
            Ok(StreamChunk::Error(error)) => return StreamOutcome::Failed(error),
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        }
    }
    // Exhaustion without a transport error counts as completion.
    StreamOutcome::Completed
}

/// Top-level coordinator for one user send.
///
/// Resolves the adapter, uploads the attachment, creates the conversation if
/// needed, persists the user turn, and drives generation through the
/// reconciler. Every failure path leaves the latest turn showing either a
/// result or a human-readable explanation.
pub struct SendOrchestrator {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<AdapterRegistry>,
    reconciler: TranscriptReconciler,
    http: reqwest::Client,
    gate: SendGate,
}

impl SendOrchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        let reconciler = TranscriptReconciler::new(store.clone(), Transcript::new());
        Self {
            store,
            blobs,
            registry,
            reconciler,
            http: reqwest::Client::new(),
            gate: SendGate::default(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        self.reconciler.transcript()
    }

    pub fn reconciler(&self) -> &TranscriptReconciler {
        &self.reconciler
    }

    pub fn is_sending(&self, conversation_id: &str) -> bool {
        self.gate.is_in_flight(conversation_id)
    }

    pub fn phase(&self, conversation_id: &str) -> SendPhase {
        self.gate.phase(conversation_id)
    }

    /// Abort the in-flight send for a conversation. The transport stream is
    /// dropped and no further chunks are delivered.
    pub fn stop(&self, conversation_id: &str) -> bool {
        self.gate.cancel(conversation_id)
    }

    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, SendError> {
        let adapter = self
            .registry
            .get(&request.provider_config_id)
            .ok_or_else(|| SendError::UnknownAdapter {
                config_id: request.provider_config_id.clone(),
            })?
            .clone();

        let gate_key = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| PENDING_CONVERSATION.to_string());
        let mut guard = self
            .gate
            .try_acquire(&gate_key)
            .ok_or(SendError::SendInFlight)?;

        let attachment_ref = match &request.file {
            Some(file) => Some(self.upload_or_inline(file, &guard).await),
            None => None,
        };

        let (conversation, created) = match &request.conversation_id {
            Some(id) => (self.find_conversation(&request.user, id).await?, false),
            None => {
                let conversation = self
                    .store
                    .create_conversation(&request.user, &title_from_text(&request.text))
                    .await?;
                guard.promote(&conversation.id);
                info!(conversation = %conversation.id, "Created conversation on first send");
                (conversation, true)
            }
        };

        let user_message = self
            .store
            .append_message(Message::user(
                &conversation.id,
                &request.text,
                attachment_ref.into_iter().collect(),
            ))
            .await?;
        guard.set_phase(SendPhase::UserMessagePersisted);
        if let Err(e) = self.reconciler.reload(&conversation.id).await {
            warn!(error = %e, "Transcript reload after user turn failed");
        }

        let fresh_attachment = request.file.as_ref().map(|file| EncodedAttachment {
            mime_type: file.mime_type.clone(),
            data: file.bytes.clone(),
        });

        let reply = match &adapter {
            ModelAdapter::Chat(chat) => {
                guard.set_phase(SendPhase::Dispatched(DispatchKind::Chat));
                self.dispatch_chat(chat, &conversation, &user_message, fresh_attachment, &guard, created)
                    .await
            }
            ModelAdapter::Image(image) => {
                guard.set_phase(SendPhase::Dispatched(DispatchKind::Image));
                self.dispatch_image(image, &conversation, &request.text, &guard)
                    .await?
            }
        };

        Ok(SendOutcome {
            conversation_id: conversation.id,
            user_message,
            reply,
        })
    }

    /// Upload the attached file, degrading to the local inline preview when
    /// the upload collaborator fails. Persistence correctness is preferred
    /// over upload success.
    async fn upload_or_inline(&self, file: &OutgoingFile, guard: &SendGuard) -> String {
        guard.set_phase(SendPhase::AttachmentUploading);
        let path = format!("uploads/{}/{}", Uuid::new_v4(), file.file_name);
        match self.blobs.upload(&path, file.bytes.clone()).await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Attachment upload failed, falling back to inline preview");
                to_data_uri(&file.mime_type, &file.bytes)
            }
        }
    }

    async fn find_conversation(
        &self,
        user: &str,
        conversation_id: &str,
    ) -> Result<Conversation, SendError> {
        self.store
            .list_conversations(user)
            .await?
            .into_iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| SendError::UnknownConversation {
                conversation_id: conversation_id.to_string(),
            })
    }

    async fn dispatch_chat(
        &self,
        chat: &ChatAdapter,
        conversation: &Conversation,
        user_message: &Message,
        fresh_attachment: Option<EncodedAttachment>,
        guard: &SendGuard,
        refresh_title: bool,
    ) -> ReplyStatus {
        let history = match self.store.list_messages(&conversation.id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Failed to load history, sending current turn only");
                vec![user_message.clone()]
            }
        };
        let prior: Vec<Message> = history
            .into_iter()
            .filter(|m| m.id != user_message.id)
            .collect();

        let composed =
            turn_composer::compose(&prior, user_message, fresh_attachment, &self.http).await;
        let stream = chat.stream(composed, guard.cancel.clone()).await;

        let mut session = self.reconciler.begin_chat(&conversation.id);
        let outcome = drive_chat_stream(stream, &self.reconciler, &mut session, &guard.cancel).await;
        guard.set_phase(SendPhase::Reconciling);

        match outcome {
            StreamOutcome::Completed => match self.reconciler.complete(&mut session).await {
                Ok(persisted) => {
                    if refresh_title {
                        self.refresh_title(chat, conversation, user_message, &persisted)
                            .await;
                    }
                    ReplyStatus::Completed(persisted)
                }
                Err(e) => {
                    let error = format!("Failed to save the response: {e}");
                    self.reconciler.fail(&mut session, &error);
                    ReplyStatus::Failed(error)
                }
            },
            StreamOutcome::Failed(error) => {
                self.reconciler.fail(&mut session, &error);
                ReplyStatus::Failed(error)
            }
            StreamOutcome::Cancelled => {
                let error = "stopped by user".to_string();
                self.reconciler.fail(&mut session, &error);
                ReplyStatus::Failed(error)
            }
        }
    }

    async fn dispatch_image(
        &self,
        image: &ImageAdapter,
        conversation: &Conversation,
        prompt: &str,
        guard: &SendGuard,
    ) -> Result<ReplyStatus, SendError> {
        let placeholder = self.reconciler.begin_image(&conversation.id).await?;

        let result = image.generate(prompt).await;
        guard.set_phase(SendPhase::Reconciling);

        match result {
            Ok(generated) => {
                if let Err(e) = self.reconciler.resolve_image(&placeholder, &generated).await {
                    warn!(error = %e, "Failed to store the generated image");
                    return Ok(ReplyStatus::Failed(format!(
                        "Failed to store the generated image: {e}"
                    )));
                }
                let resolved = self
                    .store
                    .list_messages(&conversation.id)
                    .await?
                    .into_iter()
                    .find(|m| m.id == placeholder.id)
                    .unwrap_or(placeholder);
                Ok(ReplyStatus::Completed(resolved))
            }
            Err(e) => {
                let error = e.to_string();
                if let Err(store_err) = self.reconciler.fail_image(&placeholder, &error).await {
                    warn!(error = %store_err, "Failed to record image failure on placeholder");
                }
                Ok(ReplyStatus::Failed(error))
            }
        }
    }

    /// Best-effort title refinement after the first completed exchange.
    async fn refresh_title(
        &self,
        chat: &ChatAdapter,
        conversation: &Conversation,
        user_message: &Message,
        reply: &Message,
    ) {
        match title::generate_title(chat, &user_message.content, &reply.content).await {
            Ok(new_title) => {
                if let Err(e) = self
                    .store
                    .rename_conversation(&conversation.id, &new_title)
                    .await
                {
                    warn!(error = %e, "Failed to persist generated title");
                }
            }
            Err(e) => warn!(error = ?e, "Title generation failed, keeping derived title"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider_config::{ProviderCategory, ProviderConfig};
    use crate::repositories::blob_store::{MemoryBlobStore, UploadError};
    use crate::repositories::chat_store::BoxFuture;
    use crate::repositories::memory_store::MemoryChatStore;
    use crate::services::reconciler::IMAGE_PLACEHOLDER_TEXT;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Always refuses, to exercise the inline fallback.
    struct FailingBlobStore;

    impl BlobStore for FailingBlobStore {
        fn upload(
            &self,
            path: &str,
            _bytes: Vec<u8>,
        ) -> BoxFuture<'static, Result<String, UploadError>> {
            let path = path.to_string();
            Box::pin(async move {
                Err(UploadError::UploadFailed {
                    path,
                    reason: "storage unreachable".to_string(),
                })
            })
        }
    }

    fn unreachable_config(category: ProviderCategory) -> ProviderConfig {
        let model = match category {
            ProviderCategory::Chat => "gemini-2.0-flash",
            ProviderCategory::Image => "imagen-3.0-generate-002",
        };
        ProviderConfig::new("test", category, model)
            .with_api_key("test-key")
            .with_base_url("http://127.0.0.1:1")
    }

    fn orchestrator_with(
        store: MemoryChatStore,
        blobs: Arc<dyn BlobStore>,
        config: &ProviderConfig,
    ) -> SendOrchestrator {
        let registry = AdapterRegistry::from_configs(std::slice::from_ref(config));
        SendOrchestrator::new(Arc::new(store), blobs, Arc::new(registry))
    }

    fn chat_request(config: &ProviderConfig, conversation_id: Option<String>) -> SendRequest {
        SendRequest {
            user: "alice".to_string(),
            conversation_id,
            provider_config_id: config.id.clone(),
            text: "Hello".to_string(),
            file: None,
        }
    }

    #[tokio::test]
    async fn test_failed_dispatch_never_drops_the_user_turn() {
        init_tracing();
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store.clone(), Arc::new(MemoryBlobStore::new()), &config);

        let outcome = orchestrator
            .send(chat_request(&config, None))
            .await
            .unwrap();

        // The user turn is persisted even though generation failed.
        let messages = store.list_messages(&outcome.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello");

        assert!(matches!(outcome.reply, ReplyStatus::Failed(_)));

        // The transcript shows a terminal annotation, not a stuck placeholder.
        let snapshot = orchestrator.transcript().snapshot();
        let last = snapshot.last().unwrap();
        assert!(last.content.contains("[Response failed:"));

        // The gate is released.
        assert!(!orchestrator.is_sending(&outcome.conversation_id));
        assert_eq!(orchestrator.phase(&outcome.conversation_id), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_conversation_created_lazily_on_first_send() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store.clone(), Arc::new(MemoryBlobStore::new()), &config);

        let outcome = orchestrator
            .send(chat_request(&config, None))
            .await
            .unwrap();

        let conversations = store.list_conversations("alice").await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, outcome.conversation_id);
        assert_eq!(conversations[0].title, "Hello");
    }

    #[tokio::test]
    async fn test_second_send_for_same_conversation_is_rejected() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store.clone(), Arc::new(MemoryBlobStore::new()), &config);

        let conversation = store.create_conversation("alice", "Busy").await.unwrap();
        let _held = orchestrator.gate.try_acquire(&conversation.id).unwrap();

        let result = orchestrator
            .send(chat_request(&config, Some(conversation.id.clone())))
            .await;

        assert!(matches!(result, Err(SendError::SendInFlight)));
    }

    #[tokio::test]
    async fn test_upload_failure_falls_back_to_inline_preview() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store.clone(), Arc::new(FailingBlobStore), &config);

        let mut request = chat_request(&config, None);
        request.file = Some(OutgoingFile {
            file_name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        });

        let outcome = orchestrator.send(request).await.unwrap();

        let reference = &outcome.user_message.attachments[0];
        assert!(reference.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_successful_upload_records_public_url() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let blobs = MemoryBlobStore::new();
        let orchestrator = orchestrator_with(store.clone(), Arc::new(blobs), &config);

        let mut request = chat_request(&config, None);
        request.file = Some(OutgoingFile {
            file_name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        });

        let outcome = orchestrator.send(request).await.unwrap();
        assert!(outcome.user_message.attachments[0].starts_with("memory://uploads/"));
    }

    #[tokio::test]
    async fn test_image_failure_is_persisted_on_placeholder() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Image);
        let orchestrator = orchestrator_with(store.clone(), Arc::new(MemoryBlobStore::new()), &config);

        let mut request = chat_request(&config, None);
        request.text = "a watercolor fox".to_string();

        let outcome = orchestrator.send(request).await.unwrap();
        assert!(matches!(outcome.reply, ReplyStatus::Failed(_)));

        // user turn + placeholder, with the failure written onto the
        // placeholder so a reload still explains what happened.
        let messages = store.list_messages(&outcome.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("Image generation failed"));
        assert_ne!(messages[1].content, IMAGE_PLACEHOLDER_TEXT);
    }

    #[tokio::test]
    async fn test_unknown_adapter_is_rejected() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store, Arc::new(MemoryBlobStore::new()), &config);

        let mut request = chat_request(&config, None);
        request.provider_config_id = "missing".to_string();

        let result = orchestrator.send(request).await;
        assert!(matches!(result, Err(SendError::UnknownAdapter { .. })));
    }

    #[tokio::test]
    async fn test_drive_stream_applies_cumulative_fragments() {
        let store = MemoryChatStore::new();
        let reconciler = TranscriptReconciler::new(Arc::new(store.clone()), Transcript::new());
        let conversation = store.create_conversation("alice", "Test").await.unwrap();

        let stream: ResponseStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::Text("Hi".to_string())),
            Ok(StreamChunk::Text(" there".to_string())),
            Ok(StreamChunk::Text("!".to_string())),
            Ok(StreamChunk::Done),
        ]));

        let mut session = reconciler.begin_chat(&conversation.id);
        let outcome =
            drive_chat_stream(stream, &reconciler, &mut session, &CancelFlag::new()).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(session.buffer(), "Hi there!");

        let persisted = reconciler.complete(&mut session).await.unwrap();
        assert_eq!(persisted.content, "Hi there!");
    }

    #[tokio::test]
    async fn test_drive_stream_error_is_terminal() {
        let store = MemoryChatStore::new();
        let reconciler = TranscriptReconciler::new(Arc::new(store.clone()), Transcript::new());
        let conversation = store.create_conversation("alice", "Test").await.unwrap();

        let stream: ResponseStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::Text("partial".to_string())),
            Ok(StreamChunk::Error("connection reset".to_string())),
        ]));

        let mut session = reconciler.begin_chat(&conversation.id);
        let outcome =
            drive_chat_stream(stream, &reconciler, &mut session, &CancelFlag::new()).await;

        assert_eq!(outcome, StreamOutcome::Failed("connection reset".to_string()));
        assert_eq!(session.buffer(), "partial");
    }

    #[tokio::test]
    async fn test_drive_stream_honors_cancellation() {
        let store = MemoryChatStore::new();
        let reconciler = TranscriptReconciler::new(Arc::new(store.clone()), Transcript::new());
        let conversation = store.create_conversation("alice", "Test").await.unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();

        let stream: ResponseStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::Text("never applied".to_string())),
            Ok(StreamChunk::Done),
        ]));

        let mut session = reconciler.begin_chat(&conversation.id);
        let outcome = drive_chat_stream(stream, &reconciler, &mut session, &cancel).await;

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(session.buffer(), "");
    }

    #[tokio::test]
    async fn test_stop_without_in_flight_send_is_noop() {
        let store = MemoryChatStore::new();
        let config = unreachable_config(ProviderCategory::Chat);
        let orchestrator = orchestrator_with(store, Arc::new(MemoryBlobStore::new()), &config);
        assert!(!orchestrator.stop("no-such-conversation"));
    }
}
