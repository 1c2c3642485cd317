//! Object store configuration for S3 and local filesystem output.
//!
//! The S3 client is tuned for long-running multipart uploads: generous request
//! timeouts and retries on transient failures. Retrying individual part
//! requests is left entirely to the object store client.

use crate::config::{AwsConfig, Config};
use crate::io::uploader::UploadConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts `s3://bucket/key/path` and `s3://bucket`; the key is empty for
/// the latter.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    let (bucket, key) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    if bucket.is_empty() {
        anyhow::bail!("Invalid S3 URI: missing bucket in '{}'", uri);
    }
    Ok((bucket, key))
}

/// Client options for streaming uploads.
fn create_client_options(aws: &AwsConfig) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Parts are up to tens of MiB; leave room for slow links
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(32)
        .with_allow_http(aws.allow_http)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(300),
    }
}

/// Create an authenticated S3 client for writing.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - EC2 instance profile / ECS task role
pub fn create_s3_store(bucket: &str, aws: &AwsConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(aws))
        .with_retry(create_retry_config());

    if let Some(region) = &aws.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &aws.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_virtual_hosted_style_request(false);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create the output store: LocalFileSystem if local_path is set, otherwise S3.
pub fn create_output_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match (&config.output.local_path, &config.output.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => create_s3_store(bucket, &config.aws),
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}

/// Multipart settings derived from config.
///
/// The local filesystem backend does not persist object attributes, so
/// Content-Type / Content-Encoding are only attached for S3.
pub fn upload_config(config: &Config) -> UploadConfig {
    UploadConfig {
        part_size: config.processing.upload_part_size_mb * 1024 * 1024,
        max_concurrency: config.processing.upload_concurrency,
        with_attributes: !config.output.is_local(),
    }
}
