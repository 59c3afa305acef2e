//! Background task writing flushed batches one at a time.

use std::sync::Arc;

use async_lock::Mutex;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};

use crate::{
    backend::{Backend, BackendError},
    executor::Executor,
    logging::{tidemerge_log, LogContext},
    point::Point,
    write::{metrics::WriteMetrics, WriteError},
};

/// Message dispatched to the flush worker.
pub(crate) enum FlushMsg {
    /// Write one swapped-out batch.
    Batch {
        /// Position of the batch in flush order.
        seq: u64,
        /// Target space.
        space: String,
        points: Vec<Point>,
        /// Resolved once the batch settled.
        ack_tx: oneshot::Sender<Result<usize, WriteError>>,
    },
}

/// Everything the worker loop owns.
pub(crate) struct FlushWorker<B: Backend> {
    pub(crate) backend: Arc<B>,
    pub(crate) metrics: Arc<Mutex<WriteMetrics>>,
    pub(crate) errors: flume::Sender<WriteError>,
    pub(crate) ctx: LogContext,
}

/// Spawn the worker; the returned sender feeds it batches in flush order.
pub(crate) fn spawn_worker<B, E>(
    executor: &E,
    worker: FlushWorker<B>,
) -> (mpsc::UnboundedSender<FlushMsg>, E::JoinHandle<()>)
where
    B: Backend,
    E: Executor,
{
    let (sender, receiver) = mpsc::unbounded();
    let join = executor.spawn(worker.run(receiver));
    (sender, join)
}

impl<B: Backend> FlushWorker<B> {
    /// Drain batches strictly in order. A batch's backend write is issued only
    /// after the previous one settled, whatever its outcome.
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<FlushMsg>) {
        let ready = self.backend.startup().await;
        if let Err(err) = &ready {
            tidemerge_log!(
                log::Level::Error,
                ctx: self.ctx,
                "write_backend_unavailable",
                "error={}",
                err,
            );
        }

        while let Some(msg) = receiver.next().await {
            let FlushMsg::Batch {
                seq,
                space,
                points,
                ack_tx,
            } = msg;
            let result = self.write_batch(&ready, seq, &space, points).await;
            if let Err(err) = &result {
                let _ = self.errors.send(err.clone());
            }
            let _ = ack_tx.send(result);
        }
        tidemerge_log!(
            log::Level::Debug,
            ctx: self.ctx,
            "write_worker_stopped",
            "",
        );
    }

    async fn write_batch(
        &self,
        ready: &Result<(), BackendError>,
        seq: u64,
        space: &str,
        points: Vec<Point>,
    ) -> Result<usize, WriteError> {
        let count = points.len();
        if count == 0 {
            return Ok(0);
        }
        let outcome = match ready {
            Ok(()) => self.backend.write(points, space).await,
            Err(err) => Err(err.clone()),
        };
        match outcome {
            Ok(()) => {
                self.metrics.lock().await.record_flush(count);
                tidemerge_log!(
                    log::Level::Debug,
                    ctx: self.ctx,
                    "write_flushed",
                    "seq={} space={} points={}",
                    seq,
                    space,
                    count,
                );
                Ok(count)
            }
            Err(source) => {
                self.metrics.lock().await.record_failure(count);
                tidemerge_log!(
                    log::Level::Warn,
                    ctx: self.ctx,
                    "write_flush_failed",
                    "seq={} space={} points_lost={} error={}",
                    seq,
                    space,
                    count,
                    source,
                );
                Err(WriteError::Flush {
                    seq,
                    points: count,
                    source,
                })
            }
        }
    }
}
