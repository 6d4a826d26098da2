use uuid::Uuid;

/// Terminal state of a streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Completed,
    Failed(String),
}

/// An in-progress assistant reply.
///
/// Ephemeral: identified by a locally generated id that is never persisted,
/// holding the cumulative text buffer. Bounded by one orchestrated send.
#[derive(Debug)]
pub struct StreamingSession {
    local_id: Uuid,
    conversation_id: String,
    buffer: String,
    state: SessionState,
}

impl StreamingSession {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            buffer: String::new(),
            state: SessionState::Streaming,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Cumulative text accumulated so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn push_fragment(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn mark_completed(&mut self) {
        self.state = SessionState::Completed;
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.state = SessionState::Failed(error.to_string());
    }

    pub fn is_terminal(&self) -> bool {
        self.state != SessionState::Streaming
    }
}
