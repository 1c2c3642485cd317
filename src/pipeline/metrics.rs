//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

const MB: f64 = 1024.0 * 1024.0;

/// Metrics for one export run.
#[derive(Debug)]
pub struct Metrics {
    /// Bytes received from the database
    pub bytes_read: AtomicU64,

    /// Chunks received from the database
    pub source_chunks: AtomicU64,

    /// Data records rewritten (header excluded)
    pub records: AtomicU64,

    /// Bytes emitted by the transform stage
    pub bytes_transformed: AtomicU64,

    /// Bytes handed to the uploader (after compression, if enabled)
    pub bytes_uploaded: AtomicU64,

    /// Number of failed stages
    pub failures: AtomicU64,

    start_time: Instant,

    /// Time spent transforming (microseconds)
    pub transform_us: AtomicU64,

    /// Time spent compressing (microseconds)
    pub compress_us: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes_read: AtomicU64::new(0),
            source_chunks: AtomicU64::new(0),
            records: AtomicU64::new(0),
            bytes_transformed: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            start_time: Instant::now(),
            transform_us: AtomicU64::new(0),
            compress_us: AtomicU64::new(0),
        })
    }

    /// Record a chunk read from the source.
    pub fn add_source_chunk(&self, bytes: u64) {
        self.source_chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_records(&self, records: u64) {
        self.records.store(records, Ordering::Relaxed);
    }

    pub fn add_bytes_transformed(&self, bytes: u64) {
        self.bytes_transformed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transform_time(&self, duration: Duration) {
        self.transform_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_compress_time(&self, duration: Duration) {
        self.compress_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Read throughput in MB/s.
    pub fn read_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / MB / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let bytes_transformed = self.bytes_transformed.load(Ordering::Relaxed);
        let bytes_uploaded = self.bytes_uploaded.load(Ordering::Relaxed);

        MetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            source_chunks: self.source_chunks.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            bytes_transformed,
            bytes_uploaded,
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mbps: self.read_throughput_mbps(),
            compression_ratio: if bytes_uploaded > 0 {
                bytes_transformed as f64 / bytes_uploaded as f64
            } else {
                0.0
            },
            transform_secs: self.transform_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            compress_secs: self.compress_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub source_chunks: u64,
    pub records: u64,
    pub bytes_transformed: u64,
    pub bytes_uploaded: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mbps: f64,
    /// Transformed bytes per uploaded byte (1.0 without compression)
    pub compression_ratio: f64,
    /// Busy time of the transform stage in seconds
    pub transform_secs: f64,
    /// Busy time of the compression stage in seconds
    pub compress_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Records: {} | Read: {:.2} MB in {} chunks @ {:.2} MB/s | \
             Transformed: {:.2} MB | Uploaded: {:.2} MB (ratio {:.2}) | \
             Time: transform {:.1}s compress {:.1}s | Failures: {} | Elapsed: {:.1}s",
            self.records,
            self.bytes_read as f64 / MB,
            self.source_chunks,
            self.read_throughput_mbps,
            self.bytes_transformed as f64 / MB,
            self.bytes_uploaded as f64 / MB,
            self.compression_ratio,
            self.transform_secs,
            self.compress_secs,
            self.failures,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Log a snapshot every interval until `shutdown` fires or closes.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_source_chunk(1000);
        metrics.add_source_chunk(500);

        assert_eq!(metrics.bytes_read.load(Ordering::Relaxed), 1500);
        assert_eq!(metrics.source_chunks.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.set_records(42);
        metrics.add_bytes_transformed(4000);
        metrics.add_bytes_uploaded(1000);
        metrics.add_failure();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.records, 42);
        assert_eq!(snapshot.failures, 1);
        assert!((snapshot.compression_ratio - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_display_and_json() {
        let metrics = Metrics::new();
        metrics.set_records(3);
        let snapshot = metrics.snapshot();

        assert!(snapshot.to_string().starts_with("Records: 3"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["records"], 3);
        assert!(json["elapsed"].is_f64());
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics
            .snapshot()
            .save_to_file(path.to_str().unwrap())
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"bytes_uploaded\""));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 3600);
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
