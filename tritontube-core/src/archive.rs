//! Cold-tier archive seam.
//!
//! Segment uploads may carry an S3 bucket/key pair; the storage service
//! pushes a copy through this trait alongside peer replication. The real
//! uploader lives outside the core.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

#[async_trait]
pub trait ArchiveUploader: Send + Sync {
    async fn upload_segment(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;
}

/// Disables cold-tier interaction in local development.
pub struct NoopArchiveUploader;

#[async_trait]
impl ArchiveUploader for NoopArchiveUploader {
    async fn upload_segment(&self, _bucket: &str, _key: &str, _body: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Adapts a plain function, mainly for tests.
pub struct FuncArchiveUploader<F>(pub F)
where
    F: Fn(String, String, Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync;

#[async_trait]
impl<F> ArchiveUploader for FuncArchiveUploader<F>
where
    F: Fn(String, String, Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn upload_segment(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        (self.0)(bucket.to_string(), key.to_string(), body).await
    }
}
