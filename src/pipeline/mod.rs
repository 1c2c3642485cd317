//! Export pipeline: stage tasks, compression, upload naming and metrics.

pub mod compression;
mod destination;
mod metrics;
mod orchestrator;
mod stages;
mod state;


pub use compression::StreamCompressor;
pub use destination::{key_timestamp, Destination, CONTENT_TYPE};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::{ExportJob, ExportReport, PipelineConfig, PipelineOrchestrator};
pub use stages::{into_body, spawn_compression_stage, spawn_transform_stage, Frame, StageContext};
pub use state::{PipelineState, PipelineStatus};
