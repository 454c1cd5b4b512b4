use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("invalid blob path: {0}")]
    InvalidPath(String),
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Where an uploaded blob lives inside the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub path: String,
}

/// Attachment storage. Only used for message attachments.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobHandle, BlobError>;

    fn public_url(&self, handle: &BlobHandle) -> String;
}

/// Upload path for an attachment: `{owner}/{content-hash}.{ext}`.
///
/// Identical bytes from the same owner map to the same path.
pub fn attachment_path(owner_id: &str, file_name: &str, bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hash = hex::encode(&digest[..16]);
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => format!("{owner_id}/{hash}.{}", ext.to_ascii_lowercase()),
        _ => format!("{owner_id}/{hash}"),
    }
}

/// Blob store backed by a local directory.
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self { root: root.into(), base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(path);
        let clean = !path.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<BlobHandle, BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
        log::debug!("stored blob {path} ({} bytes)", bytes.len());
        Ok(BlobHandle { path: path.to_string() })
    }

    fn public_url(&self, handle: &BlobHandle) -> String {
        format!("{}/{}", self.base_url, handle.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_path_is_deterministic() {
        let a = attachment_path("u1", "Report.PDF", b"same bytes");
        let b = attachment_path("u1", "other-name.pdf", b"same bytes");
        assert_eq!(a, b);
        assert!(a.starts_with("u1/"));
        assert!(a.ends_with(".pdf"));
        assert_ne!(a, attachment_path("u1", "x.pdf", b"different"));
        assert!(!attachment_path("u1", "noext", b"x").contains('.'));
    }

    #[tokio::test]
    async fn upload_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "https://cdn.example/files/");

        let handle = store.upload("u1/abc.txt", b"hello").await.unwrap();
        let on_disk = std::fs::read(dir.path().join("u1/abc.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
        assert_eq!(store.public_url(&handle), "https://cdn.example/files/u1/abc.txt");
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "http://x");

        for bad in ["../etc/passwd", "/abs/path", "", "u1/../../x"] {
            let err = store.upload(bad, b"x").await.unwrap_err();
            assert!(matches!(err, BlobError::InvalidPath(_)), "{bad} accepted");
        }
    }
}
