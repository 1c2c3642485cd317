//! Stage tasks connected by bounded channels.
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌─────────────┐     ┌──────────┐
//! │ RowSource  │────▶│  Transform  │────▶│ Compression │────▶│ Uploader │
//! │ (COPY OUT) │     │    Stage    │     │ (optional)  │     │          │
//! └────────────┘     └─────────────┘     └─────────────┘     └──────────┘
//!                      transform_rx        compress_rx          Body
//! ```
//!
//! Each channel has one writer and one reader. A full channel suspends the
//! writer, which is what bounds memory for arbitrarily large tables.
//!
//! Frames carry an explicit end marker. A reader that sees its channel close
//! without [`Frame::End`] knows the writer died and reports
//! [`ExportError::Interrupted`] instead of treating the truncated stream as
//! complete.

use crate::error::{ExportError, Stage};
use crate::io::{Body, SourceStream};
use crate::pipeline::compression::StreamCompressor;
use crate::pipeline::state::{PipelineState, PipelineStatus};
use crate::pipeline::Metrics;
use crate::transform::TransformStage;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Unit passed between stages.
#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    /// Upstream finished cleanly; no more frames follow.
    End,
    /// Upstream failed; no more frames follow.
    Failed(ExportError),
}

/// Shared handles every stage task needs.
#[derive(Clone)]
pub struct StageContext {
    pub metrics: Arc<Metrics>,
    pub status: Arc<PipelineStatus>,
    pub cancel: CancellationToken,
}

/// Spawn the transform stage reading from the database stream.
pub fn spawn_transform_stage(
    mut source: SourceStream,
    mut stage: TransformStage,
    flush_bytes: usize,
    tx: mpsc::Sender<Frame>,
    ctx: StageContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut out = Vec::with_capacity(flush_bytes);

        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!("Transform stage cancelled");
                    return;
                }
                next = source.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    ctx.metrics.add_source_chunk(chunk.len() as u64);
                    let start = Instant::now();
                    let pushed = stage.push(&chunk, &mut out);
                    ctx.metrics.add_transform_time(start.elapsed());
                    ctx.metrics.set_records(stage.data_records());

                    if let Err(e) = pushed {
                        fail(&tx, &ctx, e.into()).await;
                        return;
                    }
                    if out.len() >= flush_bytes && !send_output(&tx, &ctx, &mut out).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    fail(&tx, &ctx, e.into()).await;
                    return;
                }
                None => {
                    ctx.status.transition(PipelineState::Draining);
                    if let Err(e) = stage.finish(&mut out) {
                        fail(&tx, &ctx, e.into()).await;
                        return;
                    }
                    ctx.metrics.set_records(stage.data_records());
                    if !out.is_empty() && !send_output(&tx, &ctx, &mut out).await {
                        return;
                    }
                    tracing::debug!(
                        "Transform stage finished after {} records ({} data)",
                        stage.records_emitted(),
                        stage.data_records()
                    );
                    let _ = tx.send(Frame::End).await;
                    return;
                }
            }
        }
    })
}

/// Send accumulated output downstream. Returns false if the receiver is gone.
async fn send_output(tx: &mpsc::Sender<Frame>, ctx: &StageContext, out: &mut Vec<u8>) -> bool {
    let bytes = Bytes::from(std::mem::take(out));
    ctx.metrics.add_bytes_transformed(bytes.len() as u64);
    if tx.send(Frame::Data(bytes)).await.is_err() {
        tracing::debug!("Transform receiver dropped, stopping transform stage");
        return false;
    }
    true
}

async fn fail(tx: &mpsc::Sender<Frame>, ctx: &StageContext, error: ExportError) {
    tracing::error!("{}", error);
    ctx.metrics.add_failure();
    ctx.status.transition(PipelineState::Failed);
    let _ = tx.send(Frame::Failed(error)).await;
}

/// Spawn the compression stage on the blocking pool.
pub fn spawn_compression_stage(
    mut rx: mpsc::Receiver<Frame>,
    tx: mpsc::Sender<Frame>,
    level: i32,
    ctx: StageContext,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut compressor = match StreamCompressor::new(level) {
            Ok(c) => Some(c),
            Err(e) => {
                fail_blocking(&tx, &ctx, e.into());
                return;
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                tracing::debug!("Compression stage cancelled");
                return;
            }

            let frame = match rx.blocking_recv() {
                Some(frame) => frame,
                None => {
                    let error = ExportError::Interrupted {
                        stage: Stage::Transform,
                    };
                    fail_blocking(&tx, &ctx, error);
                    return;
                }
            };

            let start = Instant::now();
            let outgoing = match frame {
                Frame::Data(chunk) => compressor
                    .as_mut()
                    .map(|c| c.compress(&chunk))
                    .transpose(),
                Frame::End => compressor.take().map(StreamCompressor::finish).transpose(),
                Frame::Failed(e) => {
                    // Already counted upstream; pass it on untouched.
                    let _ = tx.blocking_send(Frame::Failed(e));
                    return;
                }
            };
            ctx.metrics.add_compress_time(start.elapsed());

            let finished = compressor.is_none();
            match outgoing {
                Ok(Some(bytes)) if !bytes.is_empty() => {
                    if tx.blocking_send(Frame::Data(bytes)).is_err() {
                        tracing::debug!("Compression receiver dropped, stopping compression stage");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    fail_blocking(&tx, &ctx, e.into());
                    return;
                }
            }

            if finished {
                let _ = tx.blocking_send(Frame::End);
                return;
            }
        }
    })
}

fn fail_blocking(tx: &mpsc::Sender<Frame>, ctx: &StageContext, error: ExportError) {
    tracing::error!("{}", error);
    ctx.metrics.add_failure();
    ctx.status.transition(PipelineState::Failed);
    let _ = tx.blocking_send(Frame::Failed(error));
}

/// Adapt the last stage's channel into an upload body.
///
/// `producer` names the stage writing into `rx`, for reporting a channel that
/// closes without an end marker.
pub fn into_body(rx: mpsc::Receiver<Frame>, producer: Stage, metrics: Arc<Metrics>) -> Body {
    stream::unfold(Some(rx), move |rx| {
        let metrics = metrics.clone();
        async move {
            let mut rx = rx?;
            match rx.recv().await {
                Some(Frame::Data(bytes)) => {
                    metrics.add_bytes_uploaded(bytes.len() as u64);
                    Some((Ok(bytes), Some(rx)))
                }
                Some(Frame::End) => None,
                Some(Frame::Failed(e)) => Some((Err(e), None)),
                None => Some((Err(ExportError::Interrupted { stage: producer }), None)),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use futures::TryStreamExt;

    fn ctx() -> StageContext {
        StageContext {
            metrics: Metrics::new(),
            status: Arc::new(PipelineStatus::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn source(chunks: Vec<Result<&'static str, SourceError>>) -> SourceStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        )
        .boxed()
    }

    async fn collect(body: Body) -> Result<Vec<u8>, ExportError> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_transform_stage_output() {
        let ctx = ctx();
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_transform_stage(
            source(vec![Ok("id,na"), Ok("me\n1,al"), Ok("ice\n2,\n")]),
            TransformStage::default(),
            1,
            tx,
            ctx.clone(),
        );

        let out = collect(into_body(rx, Stage::Transform, ctx.metrics.clone())).await.unwrap();
        handle.await.unwrap();

        assert_eq!(out, b"id,name\nx-1,x-alice\nx-2,\n");
        assert_eq!(ctx.status.current(), PipelineState::Draining);
        assert_eq!(ctx.metrics.snapshot().records, 2);
    }

    #[tokio::test]
    async fn test_transform_stage_coalesces_output() {
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_transform_stage(
            source(vec![Ok("h\n"), Ok("1\n"), Ok("2\n")]),
            TransformStage::default(),
            1024,
            tx,
            ctx,
        );
        handle.await.unwrap();

        // Everything fits under flush_bytes, so one data frame then the end marker
        assert!(matches!(rx.recv().await, Some(Frame::Data(b)) if &b[..] == b"h\nx-1\nx-2\n"));
        assert!(matches!(rx.recv().await, Some(Frame::End)));
    }

    #[tokio::test]
    async fn test_source_error_propagates() {
        let ctx = ctx();
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_transform_stage(
            source(vec![Ok("h\n1\n"), Err(SourceError::Other("connection lost".into()))]),
            TransformStage::default(),
            1,
            tx,
            ctx.clone(),
        );

        let err = collect(into_body(rx, Stage::Transform, ctx.metrics.clone()))
            .await
            .unwrap_err();
        handle.await.unwrap();

        assert_eq!(err.stage(), Stage::Source);
        assert_eq!(ctx.status.current(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_closed_channel_without_end_is_interrupted() {
        let (tx, rx) = mpsc::channel::<Frame>(1);
        tx.send(Frame::Data(Bytes::from_static(b"partial"))).await.unwrap();
        drop(tx);

        let err = collect(into_body(rx, Stage::Compression, Metrics::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Interrupted { stage: Stage::Compression }));
    }

    #[tokio::test]
    async fn test_compression_stage_roundtrip() {
        let ctx = ctx();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(4);
        let handle = spawn_compression_stage(in_rx, out_tx, 3, ctx.clone());

        let producer = tokio::spawn(async move {
            in_tx.send(Frame::Data(Bytes::from_static(b"id,name\n"))).await.unwrap();
            in_tx.send(Frame::Data(Bytes::from_static(b"x-1,x-alice\n"))).await.unwrap();
            in_tx.send(Frame::End).await.unwrap();
        });

        let compressed = collect(into_body(out_rx, Stage::Compression, ctx.metrics.clone()))
            .await
            .unwrap();
        producer.await.unwrap();
        handle.await.unwrap();

        let decoded = zstd::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(decoded, b"id,name\nx-1,x-alice\n");
    }

    #[tokio::test]
    async fn test_compression_stage_forwards_failure() {
        let ctx = ctx();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(4);
        let handle = spawn_compression_stage(in_rx, out_tx, 3, ctx.clone());

        in_tx.send(Frame::Data(Bytes::from_static(b"a\n"))).await.unwrap();
        in_tx
            .send(Frame::Failed(SourceError::Other("gone".into()).into()))
            .await
            .unwrap();

        let err = collect(into_body(out_rx, Stage::Compression, ctx.metrics.clone()))
            .await
            .unwrap_err();
        handle.await.unwrap();
        assert_eq!(err.stage(), Stage::Source);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiting_transform() {
        let ctx = ctx();
        let (tx, _rx) = mpsc::channel(1);
        let handle = spawn_transform_stage(
            stream::pending().boxed(),
            TransformStage::default(),
            1,
            tx,
            ctx.clone(),
        );

        ctx.cancel.cancel();
        handle.await.unwrap();
    }
}
