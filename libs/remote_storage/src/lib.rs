//! Minimal remote-filesystem abstraction used by sync-replication cleanup
//! to delete a peer's remote WAL staging copies once they've been fully
//! replicated.
//!
//! The wire protocol and storage backend a real deployment would use
//! (S3, a remote cluster's own filesystem, ...) are out of scope here;
//! this crate only captures the handful of operations the replication
//! core actually calls, plus a local-disk backend good enough to drive
//! that core in tests and single-box deployments.

use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use thiserror::Error;

/// A path on the remote WAL staging area, relative to a peer's configured
/// `remoteWALDir`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl RemotePath {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        RemotePath(path.into())
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(s: &str) -> Self {
        RemotePath(Utf8PathBuf::from(s))
    }
}

/// Failure deleting a remote object. `NotFound` is distinguished because
/// the cleanup engine treats a missing file as a successful delete (it
/// can legitimately race with a previous attempt's retry).
#[derive(Debug, Error)]
pub enum RemoteDeleteError {
    #[error("remote object not found")]
    NotFound,
    #[error("remote delete failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// The subset of remote storage behavior the replication core depends on.
#[async_trait::async_trait]
pub trait RemoteWalStorage: Send + Sync {
    async fn delete(&self, path: &RemotePath) -> Result<(), RemoteDeleteError>;
}

/// Where a sync-replication peer's remote WAL copies live.
#[derive(Clone, Debug)]
pub struct RemoteStorageConfig {
    pub root: Utf8PathBuf,
}

impl RemoteStorageConfig {
    pub fn local(root: impl Into<Utf8PathBuf>) -> Self {
        RemoteStorageConfig { root: root.into() }
    }
}

/// Local-disk remote WAL backend, the only backend this crate ships.
/// Dispatch is a single variant today, but kept as an enum (mirroring the
/// teacher's `GenericRemoteStorage`) so a networked backend can be added
/// without reshaping call sites.
#[derive(Clone, Debug)]
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
}

impl GenericRemoteStorage {
    pub fn from_config(config: &RemoteStorageConfig) -> Self {
        GenericRemoteStorage::LocalFs(LocalFs::new(config.root.clone()))
    }
}

#[async_trait::async_trait]
impl RemoteWalStorage for GenericRemoteStorage {
    async fn delete(&self, path: &RemotePath) -> Result<(), RemoteDeleteError> {
        match self {
            GenericRemoteStorage::LocalFs(fs) => fs.delete(path).await,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalFs {
    root: Utf8PathBuf,
}

impl LocalFs {
    pub fn new(root: Utf8PathBuf) -> Self {
        LocalFs { root }
    }

    fn full_path(&self, path: &RemotePath) -> Utf8PathBuf {
        self.root.join(path.as_path())
    }
}

#[async_trait::async_trait]
impl RemoteWalStorage for LocalFs {
    async fn delete(&self, path: &RemotePath) -> Result<(), RemoteDeleteError> {
        let full = self.full_path(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RemoteDeleteError::NotFound),
            Err(e) => Err(RemoteDeleteError::Other(anyhow::Error::new(e).context(format!(
                "deleting remote WAL {full}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_missing_file_is_not_found() {
        let dir = camino_tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path().to_path_buf());
        let err = fs.delete(&RemotePath::from("does-not-exist")).await.unwrap_err();
        assert!(matches!(err, RemoteDeleteError::NotFound));
    }

    #[tokio::test]
    async fn delete_existing_file_succeeds() {
        let dir = camino_tempfile::tempdir().unwrap();
        let file_path = dir.path().join("w.1");
        tokio::fs::write(&file_path, b"wal bytes").await.unwrap();
        let fs = LocalFs::new(dir.path().to_path_buf());
        fs.delete(&RemotePath::from("w.1")).await.unwrap();
        assert!(!file_path.exists());
    }
}
