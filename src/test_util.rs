use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::file_store::{FileStore, FileStoreError};

/// [FileStore] keeping files in memory, for tests that do not care about the file system
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl InMemoryFileStore {
    pub fn new() -> InMemoryFileStore {
        Default::default()
    }

    pub fn insert(&self, name: &str, content: Vec<u8>) {
        self.files.lock().unwrap()
            .insert(name.to_string(), content);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap()
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn create(&self, name: &str) -> Result<(), FileStoreError> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(name) {
            return Err(FileStoreError::AlreadyExists(name.to_string()));
        }
        files.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn append(&self, name: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        self.files.lock().unwrap()
            .get_mut(name)
            .ok_or_else(|| FileStoreError::NotFound(name.to_string()))?
            .extend_from_slice(bytes);
        Ok(())
    }

    async fn read_all(&self, name: &str) -> Result<Vec<u8>, FileStoreError> {
        self.get(name)
            .ok_or_else(|| FileStoreError::NotFound(name.to_string()))
    }
}

/// convenience for tests: localhost with an ephemeral port
pub fn localhost() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

/// creates a fresh, uniquely named directory below the system's temp dir
pub async fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await
        .expect("temp dir should be creatable");
    dir
}
