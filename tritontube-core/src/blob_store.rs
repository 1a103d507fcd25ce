use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, TritonError};

/// BlobStore persists segment payloads under `<root>/<bucket>/<object>`.
///
/// Writes are atomic: the payload goes to `<path>.tmp`, is fsynced, then
/// renamed over the final path. A failed write never leaves a partial file
/// at the final path.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, object: &str) -> Result<PathBuf> {
        if bucket.is_empty() || object.is_empty() {
            return Err(TritonError::InvalidRequest(
                "bucket and object are required".to_string(),
            ));
        }
        for component in object.split('/').chain([bucket]) {
            if component.is_empty() || component == "." || component == ".." {
                return Err(TritonError::InvalidRequest(format!(
                    "invalid object path component: {}",
                    component
                )));
            }
        }
        Ok(self.root.join(bucket).join(object))
    }

    /// Stores a segment payload, returning its size and SHA-256 checksum.
    pub async fn put(&self, bucket: &str, object: &str, data: Bytes) -> Result<(u64, String)> {
        let path = self.object_path(bucket, object)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let checksum = compute_hash(&data);
        let temp_path = tmp_path(&path);

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await?;
            Ok::<_, std::io::Error>(())
        };
        if let Err(error) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        tracing::debug!(
            "stored blob {}/{} ({} bytes, sha256={})",
            bucket,
            object,
            data.len(),
            checksum
        );
        Ok((data.len() as u64, checksum))
    }

    /// Opens a stored segment for streaming.
    pub async fn get(&self, bucket: &str, object: &str) -> Result<fs::File> {
        let path = self.object_path(bucket, object)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(
                TritonError::NotFound(format!("blob {}/{}", bucket, object)),
            ),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn exists(&self, bucket: &str, object: &str) -> bool {
        match self.object_path(bucket, object) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Compute the SHA-256 hash of data as lowercase hex.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let data = Bytes::from_static(b"segment payload");
        let (size, checksum) = store.put("videos", "v1/720p/0", data.clone()).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(checksum, compute_hash(&data));

        let mut file = store.get("videos", "v1/720p/0").await.unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, data);
    }

    #[tokio::test]
    async fn test_no_tmp_file_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        store
            .put("videos", "v1/720p/1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let tmp = dir.path().join("videos/v1/720p/1.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let err = store.get("videos", "absent").await.unwrap_err();
        assert!(matches!(err, TritonError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_traversal_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let err = store
            .put("videos", "../escape", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TritonError::InvalidRequest(_)));
    }
}
