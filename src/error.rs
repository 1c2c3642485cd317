//! Error types for each pipeline stage.
//!
//! Every stage has its own error enum. [`ExportError`] wraps them and records
//! which stage failed, so the caller can tell a lost database connection apart
//! from a rejected upload.

use std::fmt;
use thiserror::Error;
use tokio::task::JoinError;

/// Identifies a stage in the export chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Source,
    Transform,
    Compression,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Transform => "transform",
            Stage::Compression => "compression",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Failures raised by the database side of the export.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("export session already released")]
    Released,

    /// Anything a non-postgres source wants to report.
    #[error("{0}")]
    Other(String),
}

/// Failures while reassembling or rewriting records.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("record {record} is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { record: u64, valid_up_to: usize },
}

/// Failures inside the streaming compressor.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("zstd encoder failed: {0}")]
    Zstd(#[from] std::io::Error),
}

/// Failures reported by the storage backend.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("{0}")]
    Other(String),
}

/// A pipeline-level failure, tagged with the stage that caused it.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("source stage failed: {0}")]
    Source(#[from] SourceError),

    #[error("transform stage failed: {0}")]
    Transform(#[from] TransformError),

    #[error("compression stage failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("upload stage failed: {0}")]
    Sink(#[from] SinkError),

    /// A stage dropped its output channel without signalling end-of-stream.
    #[error("{stage} stage stopped before end of stream")]
    Interrupted { stage: Stage },

    /// A stage task panicked or was cancelled by the runtime.
    #[error("{stage} stage task aborted: {source}")]
    Aborted {
        stage: Stage,
        #[source]
        source: JoinError,
    },
}

impl ExportError {
    /// The stage that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            ExportError::Source(_) => Stage::Source,
            ExportError::Transform(_) => Stage::Transform,
            ExportError::Compression(_) => Stage::Compression,
            ExportError::Sink(_) => Stage::Upload,
            ExportError::Interrupted { stage } | ExportError::Aborted { stage, .. } => *stage,
        }
    }
}
