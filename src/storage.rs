//! Object storage collaborator
//!
//! Steps flagged with `store_in_r2` hand their file results to an object
//! store. The engine only depends on this interface; real backends live
//! outside the core.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Upload capability consumed by the execution engine.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file and return its public URL.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<String>;
}

/// In-memory store for tests: records uploads and returns stable URLs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    uploads: Mutex<HashMap<String, String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path recorded for `bucket/key`, if an upload happened.
    pub fn uploaded(&self, bucket: &str, key: &str) -> Option<String> {
        self.uploads
            .lock()
            .expect("store lock poisoned")
            .get(&format!("{bucket}/{key}"))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<String> {
        self.uploads
            .lock()
            .expect("store lock poisoned")
            .insert(
                format!("{bucket}/{key}"),
                path.to_string_lossy().into_owned(),
            );
        Ok(format!("https://storage.local/{bucket}/{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_records_uploads() {
        let store = MemoryObjectStore::new();
        let url = store
            .put_file("assets", "run/1.bin", Path::new("/tmp/1.bin"))
            .await
            .unwrap();
        assert_eq!(url, "https://storage.local/assets/run/1.bin");
        assert_eq!(
            store.uploaded("assets", "run/1.bin"),
            Some("/tmp/1.bin".to_string())
        );
        assert_eq!(store.uploaded("assets", "other"), None);
    }
}
