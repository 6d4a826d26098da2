use std::sync::Arc;

use tracing::warn;

use crate::models::message::Message;
use crate::models::streaming_session::StreamingSession;
use crate::models::transcript::{EntryId, Transcript, TranscriptEntry};
use crate::repositories::chat_store::ChatStore;
use crate::repositories::error::StoreResult;

use super::generative_client::InlineImage;

pub const IMAGE_PLACEHOLDER_TEXT: &str = "Generating image…";

/// Owns the optimistic assistant placeholder for one send and folds the
/// result back into canonical state.
///
/// Streaming: the placeholder lives only in the transcript and is written to
/// the store exactly once, on completion. Image generation: the placeholder
/// is persisted up front so a reload during a long-running request does not
/// lose the turn, then updated in place.
#[derive(Clone)]
pub struct TranscriptReconciler {
    store: Arc<dyn ChatStore>,
    transcript: Transcript,
}

impl TranscriptReconciler {
    pub fn new(store: Arc<dyn ChatStore>, transcript: Transcript) -> Self {
        Self { store, transcript }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Replace the transcript with the canonical persisted message list.
    pub async fn reload(&self, conversation_id: &str) -> StoreResult<()> {
        let messages = self.store.list_messages(conversation_id).await?;
        self.transcript.replace_with_messages(&messages);
        Ok(())
    }

    /// Materialize an empty placeholder and start a streaming session.
    pub fn begin_chat(&self, conversation_id: &str) -> StreamingSession {
        let session = StreamingSession::new(conversation_id);
        self.transcript
            .append(TranscriptEntry::placeholder(session.local_id()));
        session
    }

    /// Fold one fragment into the session and re-render the placeholder with
    /// the cumulative buffer. The content is always the full accumulated
    /// text, never a delta, so repeated application of the same state is a
    /// no-op.
    pub fn apply_chunk(&self, session: &mut StreamingSession, fragment: &str) {
        session.push_fragment(fragment);
        self.transcript
            .set_content(&EntryId::Local(session.local_id()), session.buffer());
    }

    /// Persist the final text (the single store write for this session) and
    /// replace the placeholder wholesale with the canonical record. The
    /// post-write reload is non-critical: its failure is logged and does not
    /// roll back the persisted message.
    pub async fn complete(&self, session: &mut StreamingSession) -> StoreResult<Message> {
        session.mark_completed();
        let message = Message::assistant_text(session.conversation_id(), session.buffer());
        let persisted = self.store.append_message(message).await?;

        if let Err(e) = self.reload(session.conversation_id()).await {
            warn!(error = %e, "Post-completion reload failed, transcript refresh deferred");
        }

        Ok(persisted)
    }

    /// Annotate the placeholder with a visible error. Nothing is persisted;
    /// the transcript stays un-reconciled until the next full reload.
    pub fn fail(&self, session: &mut StreamingSession, error: &str) {
        session.mark_failed(error);
        let annotated = if session.buffer().is_empty() {
            format!("[Response failed: {error}]")
        } else {
            format!("{}\n\n[Response interrupted: {error}]", session.buffer())
        };
        self.transcript
            .set_content(&EntryId::Local(session.local_id()), &annotated);
    }

    /// Persist an image placeholder immediately and surface it as pending.
    pub async fn begin_image(&self, conversation_id: &str) -> StoreResult<Message> {
        let placeholder = self
            .store
            .append_message(Message::assistant_text(conversation_id, IMAGE_PLACEHOLDER_TEXT))
            .await?;
        self.reload(conversation_id).await?;

        let id = EntryId::Persisted(placeholder.id.clone());
        self.transcript.transform(|entries| {
            entries
                .into_iter()
                .map(|mut entry| {
                    if entry.id == id {
                        entry.pending = true;
                    }
                    entry
                })
                .collect()
        });

        Ok(placeholder)
    }

    /// Swap the persisted placeholder's payload for the resolved image.
    pub async fn resolve_image(
        &self,
        placeholder: &Message,
        image: &InlineImage,
    ) -> StoreResult<()> {
        self.store
            .update_message(&placeholder.id, "", Some(&image.to_data_uri()))
            .await?;
        self.reload(&placeholder.conversation_id).await
    }

    /// Record the failure on the persisted placeholder so the conversation
    /// always reflects what happened.
    pub async fn fail_image(&self, placeholder: &Message, error: &str) -> StoreResult<()> {
        self.store
            .update_message(
                &placeholder.id,
                &format!("Image generation failed: {error}"),
                None,
            )
            .await?;
        self.reload(&placeholder.conversation_id).await
    }
}
