pub mod blob_store;
pub mod chat_store;
pub mod error;
pub mod memory_store;
pub mod sqlite_store;

pub use chat_store::{BoxFuture, ChatStore};
pub use error::{StoreError, StoreResult};
