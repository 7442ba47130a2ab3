use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::packet::ErrorCode;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("disk full writing {0}")]
    DiskFull(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error on {name}: {source}")]
    Io { name: String, #[source] source: io::Error },
}

impl FileStoreError {
    pub fn from_io(name: &str, e: io::Error) -> FileStoreError {
        match e.kind() {
            io::ErrorKind::NotFound => FileStoreError::NotFound(name.to_string()),
            io::ErrorKind::PermissionDenied => FileStoreError::AccessDenied(name.to_string()),
            io::ErrorKind::AlreadyExists => FileStoreError::AlreadyExists(name.to_string()),
            io::ErrorKind::StorageFull => FileStoreError::DiskFull(name.to_string()),
            _ => FileStoreError::Io { name: name.to_string(), source: e },
        }
    }

    /// the error code reported to the peer when this error aborts a transfer
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FileStoreError::NotFound(_) => ErrorCode::FileNotFound,
            FileStoreError::AccessDenied(_) => ErrorCode::AccessViolation,
            FileStoreError::DiskFull(_) => ErrorCode::DiskFull,
            FileStoreError::AlreadyExists(_) => ErrorCode::FileAlreadyExists,
            FileStoreError::Io { .. } => ErrorCode::NotDefined,
        }
    }
}

/// Persistent storage of transferred files. Writes are append-only, so a transfer that fails
///  half-way leaves exactly the blocks that were committed before the failure.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    /// creates a new, empty file - fails if the file exists
    async fn create(&self, name: &str) -> Result<(), FileStoreError>;

    async fn append(&self, name: &str, bytes: &[u8]) -> Result<(), FileStoreError>;

    async fn read_all(&self, name: &str) -> Result<Vec<u8>, FileStoreError>;
}

/// [FileStore] on the local file system.
///
/// A *confined* store (used by the server) resolves names relative to its root directory and
///  refuses names that would escape it. An unconfined store (used by the client) takes local
///  paths as they are.
pub struct LocalFileStore {
    root: PathBuf,
    confined: bool,
}

impl LocalFileStore {
    pub fn confined(root: impl Into<PathBuf>) -> LocalFileStore {
        LocalFileStore { root: root.into(), confined: true }
    }

    pub fn unconfined() -> LocalFileStore {
        LocalFileStore { root: PathBuf::new(), confined: false }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, FileStoreError> {
        if !self.confined {
            return Ok(PathBuf::from(name));
        }

        let relative = Path::new(name);
        if !relative.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
            debug!("refusing file name {:?} which is not confined to {:?}", name, self.root);
            return Err(FileStoreError::AccessDenied(name.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn create(&self, name: &str) -> Result<(), FileStoreError> {
        let path = self.resolve(name)?;
        trace!("creating {:?}", path);

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path).await
            .map_err(|e| FileStoreError::from_io(name, e))?;
        Ok(())
    }

    async fn append(&self, name: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        let path = self.resolve(name)?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path).await
            .map_err(|e| FileStoreError::from_io(name, e))?;
        file.write_all(bytes).await
            .map_err(|e| FileStoreError::from_io(name, e))?;
        file.flush().await
            .map_err(|e| FileStoreError::from_io(name, e))
    }

    async fn read_all(&self, name: &str) -> Result<Vec<u8>, FileStoreError> {
        let path = self.resolve(name)?;
        tokio::fs::read(&path).await
            .map_err(|e| FileStoreError::from_io(name, e))
    }
}
