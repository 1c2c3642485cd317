//! Builds and runs the export chain.
//!
//! The orchestrator is the single place where failures are resolved: it opens
//! the source, wires the stages, awaits the upload, joins every stage task and
//! releases the database session on every exit path before reporting.

use crate::config::{Config, ProcessingConfig};
use crate::error::{ExportError, Stage};
use crate::io::{RowSource, StorageUploader};
use crate::pipeline::destination::Destination;
use crate::pipeline::stages::{
    into_body, spawn_compression_stage, spawn_transform_stage, StageContext,
};
use crate::pipeline::state::{PipelineState, PipelineStatus};
use crate::pipeline::Metrics;
use crate::transform::{CellRewriter, TransformStage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel and buffering settings for the chain.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames buffered between adjacent stages
    pub channel_capacity: usize,

    /// Transform output accumulated before a frame is sent
    pub flush_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            flush_bytes: 64 * 1024,
        }
    }
}

impl From<&ProcessingConfig> for PipelineConfig {
    fn from(processing: &ProcessingConfig) -> Self {
        Self {
            channel_capacity: processing.channel_capacity,
            flush_bytes: processing.flush_bytes,
        }
    }
}

/// One export to perform.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub table: String,
    pub marker: String,
    pub prefix: String,
    /// zstd level, or `None` to upload plain CSV
    pub compression_level: Option<i32>,
    pub started_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn from_config(config: &Config, started_at: DateTime<Utc>) -> Self {
        Self {
            table: config.export.table.clone(),
            marker: config.export.marker.clone(),
            prefix: config.output.prefix.clone(),
            compression_level: config.compression.effective_level(),
            started_at,
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::for_export(
            &self.prefix,
            &self.table,
            self.started_at,
            self.compression_level.is_some(),
        )
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub key: String,
    /// Data records written, header excluded
    pub records: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub compressed: bool,
    pub e_tag: Option<String>,
    pub elapsed: Duration,
}

impl std::fmt::Display for ExportReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records -> {} ({} bytes read, {} bytes written{}) in {:.1}s",
            self.records,
            self.key,
            self.bytes_read,
            self.bytes_written,
            if self.compressed { ", zstd" } else { "" },
            self.elapsed.as_secs_f64()
        )
    }
}

/// Runs exports against an injected uploader.
pub struct PipelineOrchestrator {
    uploader: Arc<dyn StorageUploader>,
    config: PipelineConfig,
    metrics: Arc<Metrics>,
    status: Arc<PipelineStatus>,
}

impl PipelineOrchestrator {
    pub fn new(
        uploader: Arc<dyn StorageUploader>,
        config: PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            uploader,
            config,
            metrics,
            status: Arc::new(PipelineStatus::new()),
        }
    }

    /// Lifecycle of the current (or last) run.
    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    /// Export `job.table` from `source` and upload it.
    ///
    /// The source is released exactly once, whatever the outcome, including a
    /// panicking uploader. Success is returned only after the uploader confirms
    /// the object is written. Runs on one orchestrator are sequential.
    pub async fn run(
        &self,
        mut source: Box<dyn RowSource>,
        job: &ExportJob,
    ) -> Result<ExportReport, ExportError> {
        self.status.reset();
        self.status.transition(PipelineState::Running);

        let result = self.execute(source.as_mut(), job).await;

        source.release().await;
        tracing::debug!("Source session released");

        match &result {
            Ok(report) => {
                self.status.transition(PipelineState::Completed);
                tracing::info!("Export complete: {}", report);
            }
            Err(e) => {
                self.status.transition(PipelineState::Failed);
                tracing::error!("Export of {} failed in {} stage: {}", job.table, e.stage(), e);
            }
        }
        result
    }

    async fn execute(
        &self,
        source: &mut dyn RowSource,
        job: &ExportJob,
    ) -> Result<ExportReport, ExportError> {
        let started = Instant::now();
        // Counters are shared across runs; report only what this run adds.
        let baseline = self.metrics.snapshot();
        let destination = job.destination();
        tracing::info!("Exporting {} to {}", job.table, destination.key);

        let stream = source.open_export(&job.table).await.inspect_err(|_| {
            self.metrics.add_failure();
        })?;

        let ctx = StageContext {
            metrics: self.metrics.clone(),
            status: self.status.clone(),
            cancel: CancellationToken::new(),
        };
        // Dropping this future must not leave stages parked on the source.
        let _cancel_on_drop = ctx.cancel.clone().drop_guard();
        let capacity = self.config.channel_capacity;

        let (transform_tx, transform_rx) = mpsc::channel(capacity);
        let mut handles = vec![(
            Stage::Transform,
            spawn_transform_stage(
                stream,
                TransformStage::new(CellRewriter::new(job.marker.as_str())),
                self.config.flush_bytes,
                transform_tx,
                ctx.clone(),
            ),
        )];

        let (body_rx, producer) = match job.compression_level {
            Some(level) => {
                let (compress_tx, compress_rx) = mpsc::channel(capacity);
                handles.push((
                    Stage::Compression,
                    spawn_compression_stage(transform_rx, compress_tx, level, ctx.clone()),
                ));
                (compress_rx, Stage::Compression)
            }
            None => (transform_rx, Stage::Transform),
        };

        let body = into_body(body_rx, producer, self.metrics.clone());
        let uploader = self.uploader.clone();
        let upload = tokio::spawn(async move {
            uploader
                .upload(
                    &destination.key,
                    body,
                    destination.content_type,
                    destination.content_encoding,
                )
                .await
        });
        let uploaded = match upload.await {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!("upload task aborted: {}", join_error);
                Err(ExportError::Aborted {
                    stage: Stage::Upload,
                    source: join_error,
                })
            }
        };

        if let Err(e) = &uploaded {
            // Unblock anything still waiting on the source.
            ctx.cancel.cancel();
            if e.stage() == Stage::Upload {
                self.metrics.add_failure();
            }
        }

        let mut aborted = None;
        for (stage, handle) in handles {
            if let Err(join_error) = handle.await {
                tracing::error!("{} stage task aborted: {}", stage, join_error);
                aborted.get_or_insert(ExportError::Aborted {
                    stage,
                    source: join_error,
                });
            }
        }

        let receipt = match (uploaded, aborted) {
            (Ok(receipt), None) => receipt,
            // A panicked stage explains a truncated stream better than the truncation does.
            (Err(ExportError::Interrupted { .. }), Some(aborted)) => return Err(aborted),
            (Err(e), _) => return Err(e),
            (Ok(_), Some(aborted)) => return Err(aborted),
        };

        let snapshot = self.metrics.snapshot();
        Ok(ExportReport {
            key: receipt.key,
            records: snapshot.records,
            bytes_read: snapshot.bytes_read.saturating_sub(baseline.bytes_read),
            bytes_written: receipt.bytes,
            compressed: job.compression_level.is_some(),
            e_tag: receipt.e_tag,
            elapsed: started.elapsed(),
        })
    }
}
