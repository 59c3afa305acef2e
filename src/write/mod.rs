//! Write path: buffer incoming points and flush them in ordered batches.
//!
//! Flushes are handed to a single background worker through a queue, so the
//! backend sees batches in the order they were cut and never two at once. A
//! failed batch is reported on the error channel and dropped; later batches
//! are still written.

pub mod metrics;
mod worker;

use std::{fmt, mem, sync::Arc};

use async_lock::Mutex;
use futures::channel::{mpsc, oneshot};
use thiserror::Error;
use ulid::Ulid;

pub use self::metrics::WriteMetrics;
use self::worker::{spawn_worker, FlushMsg, FlushWorker};
use crate::{
    backend::{Backend, BackendError, DEFAULT_SPACE},
    executor::{Executor, JoinHandle},
    logging::{tidemerge_log, LogContext},
    option::{ConfigError, EngineOption},
    point::Point,
};

/// Errors reported by the write pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The backend rejected a batch; its points are lost.
    #[error("flush {seq} of {points} points failed: {source}")]
    Flush {
        /// Position of the batch in flush order.
        seq: u64,
        /// Points in the lost batch.
        points: usize,
        /// Backend failure.
        source: BackendError,
    },
    /// The flush worker stopped before settling a batch.
    #[error("flush worker is gone")]
    WorkerGone,
}

/// Completion handle for one flush.
pub struct FlushTicket {
    /// Position of the batch in flush order.
    pub seq: u64,
    /// Points in the batch.
    pub points: usize,
    receiver: oneshot::Receiver<Result<usize, WriteError>>,
}

impl FlushTicket {
    /// Resolve once this batch and every batch before it settled; yields the
    /// number of points written.
    pub async fn settled(self) -> Result<usize, WriteError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(WriteError::WorkerGone),
        }
    }
}

impl fmt::Debug for FlushTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushTicket")
            .field("seq", &self.seq)
            .field("points", &self.points)
            .finish()
    }
}

/// Accumulates points and flushes them to the backend in FIFO batches.
pub struct WriteBatcher<E: Executor> {
    buffer: Vec<Point>,
    flush_threshold: usize,
    space: String,
    next_seq: u64,
    sender: mpsc::UnboundedSender<FlushMsg>,
    join: Option<E::JoinHandle<()>>,
    metrics: Arc<Mutex<WriteMetrics>>,
    ctx: LogContext,
}

impl<E: Executor> WriteBatcher<E> {
    /// Start a batcher whose flush worker runs on `executor`.
    ///
    /// The receiver yields every flush failure in flush order. Dropping it
    /// discards failures; they are still counted in [`WriteMetrics`].
    pub fn spawn<B: Backend>(
        backend: Arc<B>,
        option: &EngineOption,
        executor: &E,
    ) -> Result<(Self, flume::Receiver<WriteError>), ConfigError> {
        option.validate()?;
        let (errors_tx, errors) = flume::unbounded();
        let metrics = Arc::new(Mutex::new(WriteMetrics::default()));
        let ctx = LogContext::session("write", Ulid::new());
        let (sender, join) = spawn_worker(
            executor,
            FlushWorker {
                backend,
                metrics: Arc::clone(&metrics),
                errors: errors_tx,
                ctx: ctx.clone(),
            },
        );
        let batcher = Self {
            buffer: Vec::new(),
            flush_threshold: option.write_flush_threshold,
            space: DEFAULT_SPACE.to_string(),
            next_seq: 0,
            sender,
            join: Some(join),
            metrics,
            ctx,
        };
        Ok((batcher, errors))
    }

    /// Write into `space` instead of the default one.
    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = space.into();
        self
    }

    /// Buffer `points`; flushes in the background once more than the
    /// threshold is buffered.
    pub fn write(&mut self, points: impl IntoIterator<Item = Point>) {
        self.buffer.extend(points);
        if self.buffer.len() > self.flush_threshold {
            // The outcome reaches the caller through the error channel.
            let _ticket = self.flush();
        }
    }

    /// Swap out the buffered points and queue them behind earlier flushes.
    pub fn flush(&mut self) -> FlushTicket {
        let points = mem::take(&mut self.buffer);
        let seq = self.next_seq;
        self.next_seq += 1;
        let count = points.len();
        let (ack_tx, receiver) = oneshot::channel();
        let msg = FlushMsg::Batch {
            seq,
            space: self.space.clone(),
            points,
            ack_tx,
        };
        // A failed send drops `ack_tx`, which settles the ticket as `WorkerGone`.
        if self.sender.unbounded_send(msg).is_err() {
            tidemerge_log!(
                log::Level::Error,
                ctx: self.ctx,
                "write_worker_gone",
                "seq={} points_lost={}",
                seq,
                count,
            );
        }
        FlushTicket {
            seq,
            points: count,
            receiver,
        }
    }

    /// Points buffered and not yet handed to a flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Counters accumulated so far.
    pub async fn metrics(&self) -> WriteMetrics {
        self.metrics.lock().await.clone()
    }

    /// Flush whatever remains and wait until every queued batch settled.
    ///
    /// Failed batches do not fail this call; they are counted in the returned
    /// metrics and reported on the error receiver.
    pub async fn end_of_input(mut self) -> Result<WriteMetrics, WriteError> {
        let last = self.flush();
        self.sender.close_channel();
        if let Some(join) = self.join.take() {
            join.join().await.map_err(|err| {
                tidemerge_log!(
                    log::Level::Error,
                    ctx: self.ctx,
                    "write_worker_panicked",
                    "error={}",
                    err,
                );
                WriteError::WorkerGone
            })?;
        }
        // The worker exited after draining the queue, so this settles at once.
        match last.settled().await {
            Ok(_) | Err(WriteError::Flush { .. }) => {}
            Err(err) => return Err(err),
        }
        let metrics = self.metrics().await;
        tidemerge_log!(
            log::Level::Info,
            ctx: self.ctx,
            "write_input_ended",
            "flushes={} points_flushed={} failed_flushes={} points_lost={}",
            metrics.flushes,
            metrics.points_flushed,
            metrics.failed_flushes,
            metrics.points_lost,
        );
        Ok(metrics)
    }
}

impl<E: Executor> Drop for WriteBatcher<E> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            tidemerge_log!(
                log::Level::Warn,
                ctx: self.ctx,
                "write_dropped_unflushed",
                "points_lost={}",
                self.buffer.len(),
            );
        }
    }
}
