use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store initialization failed: {message}")]
    Initialization { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored data: {message}")]
    InvalidData { message: String },

    #[error("Record not found: {id}")]
    NotFound { id: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
