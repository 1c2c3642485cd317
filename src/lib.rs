//! Table Export
//!
//! Streams a PostgreSQL table out through `COPY ... TO STDOUT`, prefixes every
//! data cell with a marker, optionally zstd-compresses the result and writes it
//! to S3 (or a local directory) as a single object, in bounded memory.
//!
//! # Architecture
//!
//! - **Transform**: record reassembly across chunk boundaries and cell rewriting
//! - **I/O**: the database row source and the object store uploader
//! - **Pipeline**: stage tasks over bounded channels, orchestration and metrics
//!
//! # Usage
//!
//! ```no_run
//! use table_export::{run_export, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_export(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod transform;

pub use config::Config;
pub use error::{ExportError, Stage};
pub use io::{ObjectStoreUploader, PostgresSource, RowSource, StorageUploader};
pub use pipeline::{ExportJob, ExportReport, Metrics, PipelineConfig, PipelineOrchestrator};
pub use transform::{CellRewriter, TransformStage};

use anyhow::Result;
use pipeline::MetricsReporter;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run one export with the given configuration.
pub async fn run_export(config: Config) -> Result<ExportReport> {
    config.validate()?;

    tracing::info!("Starting export of {}", config.export.table);
    tracing::info!("Writing to: {}", config.output.path_display());

    let store = io::create_output_store(&config)?;
    let uploader = Arc::new(ObjectStoreUploader::new(store, io::upload_config(&config)));
    let source = PostgresSource::connect(&config.database).await?;

    let metrics = Metrics::new();
    let orchestrator = PipelineOrchestrator::new(
        uploader,
        PipelineConfig::from(&config.processing),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let job = ExportJob::from_config(&config, chrono::Utc::now());
    let result = orchestrator.run(Box::new(source), &job).await;

    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    if let Some(ref path) = config.processing.metrics_output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    Ok(result?)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
