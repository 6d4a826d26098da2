use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::chat_store::BoxFuture;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload of '{path}' failed: {reason}")]
    UploadFailed { path: String, reason: String },
}

/// Blob upload collaborator boundary.
///
/// Uploads file bytes under a path and returns a public URL. Upload failure
/// is never fatal to a send: callers fall back to an inline reference.
pub trait BlobStore: Send + Sync + 'static {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<String, UploadError>>;
}

/// In-memory blob store for tests and development.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).cloned()
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
    ) -> BoxFuture<'static, Result<String, UploadError>> {
        let objects = self.objects.clone();
        let path = path.to_string();
        Box::pin(async move {
            objects.lock().insert(path.clone(), bytes);
            Ok(format!("memory://{path}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_returns_public_url() {
        let store = MemoryBlobStore::new();
        let url = store
            .upload("uploads/cat.png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(url, "memory://uploads/cat.png");
        assert_eq!(store.get("uploads/cat.png"), Some(vec![1, 2, 3]));
    }
}
