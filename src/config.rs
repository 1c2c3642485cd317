//! Configuration for the table export pipeline.

use crate::pipeline::compression::LEVEL_RANGE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection
    pub database: DatabaseConfig,

    /// What to export
    pub export: ExportConfig,

    /// Where to write the export
    pub output: OutputConfig,

    /// Optional zstd compression of the uploaded object
    #[serde(default)]
    pub compression: CompressionConfig,

    /// S3 connection settings
    #[serde(default)]
    pub aws: AwsConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    pub dbname: String,

    /// Password; falls back to the PGPASSWORD environment variable when unset
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Resolve the password from config or environment.
    pub fn resolved_password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var("PGPASSWORD").ok())
    }
}

/// Source table and rewrite rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Table to export, optionally schema-qualified (`schema.table`)
    pub table: String,

    /// Prefix applied to every non-blank data cell
    #[serde(default = "default_marker")]
    pub marker: String,
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Compression level (0-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_compression_level(),
        }
    }
}

impl CompressionConfig {
    /// The level to compress with, if compression is enabled.
    pub fn effective_level(&self) -> Option<i32> {
        self.enabled.then_some(self.level)
    }
}

/// Output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local filesystem directory used instead of S3.
    /// Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Output S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix for exported objects
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl OutputConfig {
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Destination as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            format!("{}/{}", path.trim_end_matches('/'), self.prefix)
        } else {
            format!("s3://{}/{}", self.bucket.as_deref().unwrap_or(""), self.prefix)
        }
    }
}

/// S3 connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Region; taken from the environment when unset
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint (LocalStack, MinIO, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Frames buffered between adjacent stages
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Transform output accumulated before a frame is sent downstream
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    /// Multipart upload part size in MiB (S3 minimum is 5)
    #[serde(default = "default_upload_part_size_mb")]
    pub upload_part_size_mb: usize,

    /// Maximum multipart parts in flight
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            flush_bytes: default_flush_bytes(),
            upload_part_size_mb: default_upload_part_size_mb(),
            upload_concurrency: default_upload_concurrency(),
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is picked from the extension; anything else is parsed as YAML.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.output.local_path, &self.output.bucket) {
            (Some(_), Some(_)) => anyhow::bail!("Cannot specify both local_path and bucket"),
            (None, None) => anyhow::bail!("Must specify either local_path or bucket"),
            _ => {}
        }

        if self.export.table.is_empty() || self.export.table.split('.').any(str::is_empty) {
            anyhow::bail!("Invalid table name '{}'", self.export.table);
        }
        if self.export.table.split('.').count() > 2 {
            anyhow::bail!("Table name must be 'table' or 'schema.table', got '{}'", self.export.table);
        }
        if self.export.marker.contains([',', '\n']) {
            anyhow::bail!("Marker must not contain the field separator or a newline");
        }
        if self.database.user.is_empty() || self.database.dbname.is_empty() {
            anyhow::bail!("Database user and dbname must be set");
        }
        if !LEVEL_RANGE.contains(&self.compression.level) {
            anyhow::bail!("Compression level must be 0-22 for zstd");
        }
        if self.processing.channel_capacity == 0 {
            anyhow::bail!("Channel capacity must be > 0");
        }
        if self.processing.flush_bytes == 0 {
            anyhow::bail!("flush_bytes must be > 0");
        }
        if self.processing.upload_part_size_mb < 5 {
            anyhow::bail!("Upload part size must be >= 5 MiB");
        }
        if self.processing.upload_concurrency == 0 {
            anyhow::bail!("Upload concurrency must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5432 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_marker() -> String { crate::transform::DEFAULT_MARKER.to_string() }
fn default_compression_level() -> i32 { 3 }
fn default_prefix() -> String { "exports".to_string() }
fn default_channel_capacity() -> usize { 16 }
fn default_flush_bytes() -> usize { 64 * 1024 }
fn default_upload_part_size_mb() -> usize { 10 }
fn default_upload_concurrency() -> usize { 8 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
