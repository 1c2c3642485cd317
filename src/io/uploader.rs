//! Streaming upload of the export body to object storage.

use crate::error::{ExportError, SinkError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, MultipartUpload, ObjectStore, PutMultipartOpts, PutPayloadMut, PutResult,
};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Body handed to an uploader. An `Err` item means an upstream stage failed
/// and the upload must be abandoned.
pub type Body = BoxStream<'static, Result<Bytes, ExportError>>;

/// Confirmation that an object was fully written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub bytes: u64,
    pub e_tag: Option<String>,
}

/// Persists a byte stream under a key.
#[async_trait]
pub trait StorageUploader: Send + Sync {
    /// Consume `body` and store it under `key`.
    ///
    /// Returns only after the object is durably written. If `body` yields an
    /// error, nothing is persisted and that error is returned.
    async fn upload(
        &self,
        key: &str,
        body: Body,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<UploadReceipt, ExportError>;
}

/// Multipart upload settings.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Part size in bytes
    pub part_size: usize,

    /// Maximum parts in flight
    pub max_concurrency: usize,

    /// Attach Content-Type / Content-Encoding attributes
    pub with_attributes: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: 10 * 1024 * 1024,
            max_concurrency: 8,
            with_attributes: true,
        }
    }
}

/// Uploads through any [`ObjectStore`] using multipart writes.
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self { store, config }
    }

    fn attributes(&self, content_type: &str, content_encoding: Option<&str>) -> Attributes {
        let mut attributes = Attributes::new();
        if self.config.with_attributes {
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            if let Some(encoding) = content_encoding {
                attributes.insert(Attribute::ContentEncoding, encoding.to_string().into());
            }
        }
        attributes
    }
}

#[async_trait]
impl StorageUploader for ObjectStoreUploader {
    async fn upload(
        &self,
        key: &str,
        body: Body,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<UploadReceipt, ExportError> {
        let path = Path::from(key);
        let opts = PutMultipartOpts {
            attributes: self.attributes(content_type, content_encoding),
            ..Default::default()
        };

        let upload = self
            .store
            .put_multipart_opts(&path, opts)
            .await
            .map_err(SinkError::from)?;
        let (bytes, result) = write_multipart(upload, body, &self.config, key).await?;
        tracing::info!("Upload of {} complete ({} bytes)", key, bytes);

        Ok(UploadReceipt {
            key: key.to_string(),
            bytes,
            e_tag: result.e_tag,
        })
    }
}

/// Stream `body` into `upload` and complete it.
///
/// Every failure, including a rejected final part or a failed completion,
/// aborts the upload so no partial object is left behind.
async fn write_multipart(
    mut upload: Box<dyn MultipartUpload>,
    mut body: Body,
    config: &UploadConfig,
    key: &str,
) -> Result<(u64, PutResult), ExportError> {
    let bytes = match send_parts(upload.as_mut(), &mut body, config).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Aborting upload of {}: {}", key, e);
            abort(upload.as_mut(), key).await;
            return Err(e);
        }
    };

    match upload.complete().await {
        Ok(result) => Ok((bytes, result)),
        Err(e) => {
            tracing::warn!("Completing upload of {} failed: {}", key, e);
            abort(upload.as_mut(), key).await;
            Err(SinkError::from(e).into())
        }
    }
}

async fn send_parts(
    upload: &mut dyn MultipartUpload,
    body: &mut Body,
    config: &UploadConfig,
) -> Result<u64, ExportError> {
    let mut buffer = PutPayloadMut::new();
    let mut in_flight = JoinSet::new();
    let mut bytes = 0u64;

    while let Some(item) = body.next().await {
        let chunk = item?;
        bytes += chunk.len() as u64;
        buffer.push(chunk);

        if buffer.content_length() >= config.part_size {
            wait_for_capacity(&mut in_flight, config.max_concurrency.saturating_sub(1)).await?;
            let part = std::mem::replace(&mut buffer, PutPayloadMut::new()).freeze();
            in_flight.spawn(upload.put_part(part));
        }
    }

    if buffer.content_length() > 0 {
        in_flight.spawn(upload.put_part(buffer.freeze()));
    }
    wait_for_capacity(&mut in_flight, 0).await?;
    Ok(bytes)
}

/// Wait until at most `max` parts are in flight.
async fn wait_for_capacity(
    in_flight: &mut JoinSet<object_store::Result<()>>,
    max: usize,
) -> Result<(), SinkError> {
    while in_flight.len() > max {
        match in_flight.join_next().await {
            Some(Ok(result)) => result?,
            Some(Err(e)) => return Err(SinkError::Other(format!("part upload task failed: {}", e))),
            None => break,
        }
    }
    Ok(())
}

async fn abort(upload: &mut dyn MultipartUpload, key: &str) {
    if let Err(e) = upload.abort().await {
        tracing::warn!("Failed to abort multipart upload of {}: {}", key, e);
    }
}
