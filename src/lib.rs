//! Conversation orchestration core.
//!
//! `parley` turns a persisted conversation history plus a newly composed user
//! turn into a streaming model request, an optimistically updated in-memory
//! transcript, and a reconciled persisted record once generation completes or
//! fails. Persistence and blob upload are collaborator traits; SQLite and
//! in-memory implementations ship with the crate. Presentation is out of
//! scope: observers read owned transcript snapshots.

pub mod models;
pub mod repositories;
pub mod services;

pub use models::message::{Conversation, Message, Role};
pub use models::provider_config::{ImageRoute, ProviderCategory, ProviderConfig};
pub use models::transcript::{EntryId, Transcript, TranscriptEntry};
pub use repositories::blob_store::{BlobStore, MemoryBlobStore, UploadError};
pub use repositories::chat_store::ChatStore;
pub use repositories::error::{StoreError, StoreResult};
pub use repositories::memory_store::MemoryChatStore;
pub use repositories::sqlite_store::SqliteChatStore;
pub use services::adapter::{AdapterRegistry, ChatAdapter, ImageAdapter, ModelAdapter};
pub use services::attachment_encoder::{AttachmentError, EncodedAttachment};
pub use services::generative_client::{
    CancelFlag, GenerateError, GenerativeClient, InlineImage, ResponseStream, StreamChunk,
};
pub use services::orchestrator::{
    DispatchKind, OutgoingFile, ReplyStatus, SendError, SendOrchestrator, SendOutcome, SendPhase,
    SendRequest,
};
pub use services::reconciler::TranscriptReconciler;
