//! Content store for completed download files.
//!
//! Completed files are copied out of the backend's working directory into a
//! hash-addressed library layout, so working directories can be discarded
//! without losing the produced content. The store computes the content hash
//! while copying; the hash is persisted on the media record.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;

/// A file as stored in the content store
#[derive(Clone, Debug)]
pub struct FileRecord {
    /// Final path inside the store
    pub path: PathBuf,
    /// SHA-256 of the file content, hex-encoded
    pub hash: String,
    /// Size in bytes
    pub size_bytes: u64,
}

/// Destination for completed download files
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Copy a local file into the store under the given source tag.
    ///
    /// Idempotent for identical content: re-saving the same file lands on the
    /// same store path.
    async fn save_local_file(&self, path: &Path, source_tag: &str) -> Result<FileRecord>;
}

/// Filesystem store rooted at a configured directory.
///
/// Layout: `<root>/<tag>/<hash-prefix>-<file name>`. The hash prefix keeps
/// distinct contents with colliding names apart while staying human-browsable.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    /// Create a store rooted at `root` (created lazily on first save)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn save_local_file(&self, path: &Path, source_tag: &str) -> Result<FileRecord> {
        let (hash, size_bytes) = hash_file(path).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| hash.clone());

        let dir = self.root.join(source_tag);
        fs::create_dir_all(&dir).await?;
        let dest = dir.join(format!("{}-{}", &hash[..12], file_name));

        if fs::try_exists(&dest).await? {
            debug!(path = %dest.display(), "Content already stored, skipping copy");
        } else {
            copy_atomic(path, &dest).await?;
        }

        Ok(FileRecord {
            path: dest,
            hash,
            size_bytes,
        })
    }
}

/// Stream the file once, producing its content hash and size
async fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        size += read as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Copy via a temp file + rename so a crashed copy never leaves a partial
/// store entry behind
async fn copy_atomic(src: &Path, dest: &Path) -> Result<()> {
    let tmp = dest.with_extension("part");

    let mut reader = fs::File::open(src).await?;
    let mut writer = fs::File::create(&tmp).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
    }
    writer.flush().await?;
    drop(writer);

    fs::rename(&tmp, dest).await?;
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_copies_into_hash_addressed_layout() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("ep01.mkv");
        tokio::fs::write(&src, b"video bytes").await.unwrap();

        let store = LocalContentStore::new(scratch.path().join("library"));
        let record = store.save_local_file(&src, "item-7").await.unwrap();

        assert_eq!(record.size_bytes, 11);
        assert_eq!(record.hash.len(), 64);
        assert!(record.path.starts_with(scratch.path().join("library/item-7")));
        assert!(
            record
                .path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("-ep01.mkv")
        );
        assert_eq!(tokio::fs::read(&record.path).await.unwrap(), b"video bytes");
    }

    #[tokio::test]
    async fn resaving_the_same_file_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("a.bin");
        tokio::fs::write(&src, b"same content").await.unwrap();

        let store = LocalContentStore::new(scratch.path().join("library"));
        let first = store.save_local_file(&src, "item-1").await.unwrap();
        let second = store.save_local_file(&src, "item-1").await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn distinct_content_with_same_name_gets_distinct_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(scratch.path().join("library"));

        let src = scratch.path().join("clip.mkv");
        tokio::fs::write(&src, b"take one").await.unwrap();
        let first = store.save_local_file(&src, "item-1").await.unwrap();

        tokio::fs::write(&src, b"take two").await.unwrap();
        let second = store.save_local_file(&src, "item-1").await.unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(tokio::fs::read(&first.path).await.unwrap(), b"take one");
        assert_eq!(tokio::fs::read(&second.path).await.unwrap(), b"take two");
    }

    #[tokio::test]
    async fn missing_source_file_is_an_io_error() {
        let scratch = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(scratch.path().join("library"));

        let err = store
            .save_local_file(&scratch.path().join("gone.bin"), "item-1")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
