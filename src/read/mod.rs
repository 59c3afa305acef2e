//! Read path: incremental, bounded-memory merge of many paginated series.
//!
//! A [`ReadSession`] is pulled with repeated [`ReadSession::read`] calls. The
//! first call for a window enumerates its series and wraps each in a paged
//! stream whose page size is the point budget split across all series, so the
//! points buffered at once stay near `max_simultaneous_points` however large
//! the window is. Every call then alternates merge passes with refill rounds
//! until it has `limit` points or the window is drained.

mod merge;
pub mod metrics;
mod prefetch;
mod stream;

use std::sync::Arc;

use futures::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

pub use self::{metrics::ReadMetrics, stream::StreamError};
use self::{
    merge::{merge_pass, PassOutcome},
    prefetch::PrefetchScheduler,
    stream::PagedStream,
};
use crate::{
    backend::{Backend, BackendError, Fetcher, SeriesFilter, SeriesQuery, DEFAULT_SPACE},
    logging::{tidemerge_log, LogContext},
    option::{ConfigError, EngineOption},
    point::{Point, Timestamp, Window},
};

/// Errors ending a read session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The window matched more series than `max_series`.
    #[error("read window matched more than {limit} series")]
    TooManySeries {
        /// Configured series cap.
        limit: usize,
    },
    /// Backend startup or series enumeration failed.
    #[error("backend error: {0}")]
    Backend(BackendError),
    /// A stream refill failed.
    #[error("fetch failed: {0}")]
    Fetch(BackendError),
    /// A stream buffer was read while empty.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Merge bookkeeping reached a state it should never be in.
    #[error("merge invariant violated: {0}")]
    Invariant(&'static str),
    /// An earlier call failed; the session cannot continue.
    #[error("read session failed earlier and can no longer be used")]
    Poisoned,
}

/// Points produced by one [`ReadSession::read`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadChunk {
    /// `Some(window end)` once the window is exhausted (or the session was
    /// cancelled); `None` when more points remain for the same window.
    pub read_end: Option<Timestamp>,
    /// Points in ascending time order.
    pub points: Vec<Point>,
}

impl ReadChunk {
    /// No further calls for this window will yield points.
    pub fn is_final(&self) -> bool {
        self.read_end.is_some()
    }
}

/// Progress of the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No streams constructed yet.
    Building,
    /// Interleaving buffered points.
    Merging,
    /// Waiting on a refill round.
    Fetching,
    /// Window exhausted.
    Drained,
}

/// Per-window merge state.
struct MergeSession {
    window: Window,
    streams: Vec<PagedStream>,
    state: SessionState,
}

/// Resumable time-ordered read over every series matching a filter.
pub struct ReadSession<B: Backend> {
    backend: Arc<B>,
    option: EngineOption,
    scheduler: PrefetchScheduler,
    space: String,
    filter: SeriesFilter,
    merge: Option<MergeSession>,
    cancel: CancellationToken,
    poisoned: bool,
    metrics: ReadMetrics,
    ctx: LogContext,
}

impl<B: Backend> ReadSession<B> {
    /// Session reading the default space with a match-all filter.
    pub fn new(backend: Arc<B>, option: EngineOption) -> Result<Self, ConfigError> {
        option.validate()?;
        let scheduler =
            PrefetchScheduler::new(option.fetch_low_water_mark, option.max_concurrent_fetches);
        Ok(Self {
            backend,
            option,
            scheduler,
            space: DEFAULT_SPACE.to_string(),
            filter: SeriesFilter::all(),
            merge: None,
            cancel: CancellationToken::new(),
            poisoned: false,
            metrics: ReadMetrics::default(),
            ctx: LogContext::session("read", Ulid::new()),
        })
    }

    /// Read from `space` instead of the default one.
    pub fn space(self, space: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            ..self
        }
    }

    /// Restrict the read to series matching `filter`.
    pub fn filter(self, filter: SeriesFilter) -> Self {
        Self { filter, ..self }
    }

    /// Token cancelling this session from anywhere.
    ///
    /// Refills already in flight run to completion, their points are dropped
    /// and every later `read` reports the window as done.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Counters accumulated so far.
    pub fn metrics(&self) -> &ReadMetrics {
        &self.metrics
    }

    /// State of the current window.
    pub fn state(&self) -> SessionState {
        self.merge
            .as_ref()
            .map_or(SessionState::Building, |merge| merge.state)
    }

    /// Points currently buffered across all streams.
    pub fn buffered_points(&self) -> usize {
        self.merge.as_ref().map_or(0, |merge| {
            merge.streams.iter().map(PagedStream::len).sum()
        })
    }

    /// Return up to `limit` further points of `window`, in time order.
    ///
    /// Calling again with the same window continues where the previous call
    /// stopped; a different window starts over. After an error the session is
    /// poisoned.
    pub async fn read(&mut self, window: Window, limit: usize) -> Result<ReadChunk, ReadError> {
        if self.poisoned {
            return Err(ReadError::Poisoned);
        }
        match self.read_inner(window, limit).await {
            Ok(chunk) => {
                self.metrics.record_emitted(chunk.points.len());
                Ok(chunk)
            }
            Err(err) => {
                self.poisoned = true;
                self.merge = None;
                tidemerge_log!(
                    log::Level::Error,
                    ctx: self.ctx,
                    "read_failed",
                    "start={} end={} error={}",
                    window.start(),
                    window.end(),
                    err,
                );
                Err(err)
            }
        }
    }

    /// Consume the session into a stream of non-empty chunks that ends once
    /// the window is drained or the session is cancelled.
    pub fn chunks(
        mut self,
        window: Window,
        limit: usize,
    ) -> impl Stream<Item = Result<Vec<Point>, ReadError>> {
        let limit = limit.max(1);
        async_stream::try_stream! {
            loop {
                let chunk = self.read(window, limit).await?;
                let done = chunk.is_final();
                if !chunk.points.is_empty() {
                    yield chunk.points;
                }
                if done {
                    break;
                }
            }
        }
    }

    async fn read_inner(&mut self, window: Window, limit: usize) -> Result<ReadChunk, ReadError> {
        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(window));
        }
        if !matches!(&self.merge, Some(merge) if merge.window == window) {
            if let Some(previous) = &self.merge {
                tidemerge_log!(
                    log::Level::Debug,
                    ctx: self.ctx,
                    "read_window_changed",
                    "previous_start={} previous_end={} start={} end={}",
                    previous.window.start(),
                    previous.window.end(),
                    window.start(),
                    window.end(),
                );
            }
            let query = SeriesQuery {
                filter: self.filter.clone(),
                space: self.space.clone(),
                window,
                series_limit: self.option.max_series,
            };
            let fetchers = match open(Arc::clone(&self.backend), query).await {
                Ok(fetchers) => fetchers,
                Err(_) if self.cancel.is_cancelled() => return Ok(self.cancelled(window)),
                Err(err) => return Err(err),
            };
            let fetch_size = self.option.fetch_size_for(fetchers.len());
            tidemerge_log!(
                log::Level::Info,
                ctx: self.ctx,
                "read_window_opened",
                "space={} start={} end={} series={} fetch_size={}",
                self.space,
                window.start(),
                window.end(),
                fetchers.len(),
                fetch_size,
            );
            self.merge = Some(MergeSession {
                window,
                streams: fetchers
                    .into_iter()
                    .map(|fetcher| PagedStream::new(fetcher, fetch_size))
                    .collect(),
                state: SessionState::Merging,
            });
        }
        let Some(merge) = self.merge.as_mut() else {
            return Err(ReadError::Invariant("merge session missing after open"));
        };

        let mut points = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                merge.streams.clear();
                merge.state = SessionState::Drained;
                tidemerge_log!(
                    log::Level::Info,
                    ctx: self.ctx,
                    "read_cancelled",
                    "discarded_points={}",
                    points.len(),
                );
                return Ok(ReadChunk {
                    read_end: Some(window.end()),
                    points: Vec::new(),
                });
            }

            merge.streams.retain(|stream| !stream.is_exhausted());
            if merge.streams.is_empty() {
                if merge.state != SessionState::Drained {
                    tidemerge_log!(
                        log::Level::Info,
                        ctx: self.ctx,
                        "read_drained",
                        "end={} points_emitted={}",
                        window.end(),
                        self.metrics.points_emitted + points.len() as u64,
                    );
                }
                merge.state = SessionState::Drained;
                return Ok(ReadChunk {
                    read_end: Some(window.end()),
                    points,
                });
            }
            if points.len() >= limit {
                // Streams are topped up lazily, on the next call.
                return Ok(ReadChunk {
                    read_end: None,
                    points,
                });
            }

            merge.state = SessionState::Merging;
            let mut stalled = merge.streams.iter().any(PagedStream::is_empty);
            if !stalled {
                self.metrics.record_pass();
                stalled =
                    merge_pass(&mut merge.streams, limit, &mut points)? == PassOutcome::NeedsRefill;
            }
            if !stalled {
                continue;
            }

            merge.state = SessionState::Fetching;
            let eligible = self.scheduler.eligible(&merge.streams);
            if eligible == 0 {
                return Err(ReadError::Invariant(
                    "refill required but no stream is eligible",
                ));
            }
            let round = match self.scheduler.refill(&mut merge.streams).await {
                Ok(round) => round,
                // Results of refills racing a cancellation are dropped.
                Err(_) if self.cancel.is_cancelled() => continue,
                Err(err) => return Err(ReadError::Fetch(err)),
            };
            let buffered = merge.streams.iter().map(PagedStream::len).sum();
            self.metrics.record_refill(round, buffered);
            tidemerge_log!(
                log::Level::Debug,
                ctx: self.ctx,
                "read_refilled",
                "streams={} points={} buffered={} active={}",
                round.streams,
                round.points,
                buffered,
                merge.streams.len(),
            );
        }
    }

    fn cancelled(&mut self, window: Window) -> ReadChunk {
        if let Some(merge) = self.merge.as_mut() {
            merge.streams.clear();
            merge.state = SessionState::Drained;
        }
        ReadChunk {
            read_end: Some(window.end()),
            points: Vec::new(),
        }
    }
}

/// Wait for the backend and enumerate the window's series.
async fn open<B: Backend>(
    backend: Arc<B>,
    query: SeriesQuery,
) -> Result<Vec<Box<dyn Fetcher>>, ReadError> {
    backend.startup().await.map_err(ReadError::Backend)?;
    let fetchers = backend.enumerate(&query).await.map_err(|err| match err {
        BackendError::TooManySeries { limit } => ReadError::TooManySeries { limit },
        other => ReadError::Backend(other),
    })?;
    if fetchers.len() > query.series_limit {
        return Err(ReadError::TooManySeries {
            limit: query.series_limit,
        });
    }
    Ok(fetchers)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::StreamExt;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::test_util::{FetchProbe, ScriptedBackend, ScriptedFetcher};

    fn three_series() -> Vec<ScriptedFetcher> {
        vec![
            ScriptedFetcher::new("a", vec![(1, 1.0), (4, 4.0)]),
            ScriptedFetcher::new("b", vec![(2, 2.0)]),
            ScriptedFetcher::new("c", vec![(3, 3.0), (5, 5.0)]),
        ]
    }

    fn session(
        templates: Vec<ScriptedFetcher>,
        option: EngineOption,
    ) -> ReadSession<ScriptedBackend> {
        ReadSession::new(Arc::new(ScriptedBackend::new(templates)), option).expect("session")
    }

    fn labels(points: &[Point]) -> Vec<String> {
        points
            .iter()
            .map(|point| format!("{}{}", point.time.get(), point.tag("series").unwrap_or("?")))
            .collect()
    }

    fn window() -> Window {
        Window::new(0, 10).expect("window")
    }

    #[tokio::test]
    async fn single_call_merges_everything() {
        let mut session = session(three_series(), EngineOption::default());
        assert_eq!(session.state(), SessionState::Building);

        let chunk = session.read(window(), 10).await.expect("read");
        assert_eq!(labels(&chunk.points), vec!["1a", "2b", "3c", "4a", "5c"]);
        assert_eq!(chunk.read_end, Some(Timestamp::new(10)));
        assert_eq!(session.state(), SessionState::Drained);
        assert_eq!(session.metrics().points_emitted, 5);
    }

    #[tokio::test]
    async fn limited_calls_resume_where_they_stopped() {
        let mut session = session(three_series(), EngineOption::default());

        let first = session.read(window(), 2).await.expect("first");
        assert_eq!(labels(&first.points), vec!["1a", "2b"]);
        assert_eq!(first.read_end, None);

        let second = session.read(window(), 2).await.expect("second");
        assert_eq!(labels(&second.points), vec!["3c", "4a"]);
        assert_eq!(second.read_end, None);

        let third = session.read(window(), 2).await.expect("third");
        assert_eq!(labels(&third.points), vec!["5c"]);
        assert_eq!(third.read_end, Some(Timestamp::new(10)));

        let after = session.read(window(), 2).await.expect("after drain");
        assert!(after.points.is_empty());
        assert!(after.is_final());
    }

    #[tokio::test]
    async fn small_pages_keep_memory_bounded() {
        let probe = Arc::new(FetchProbe::default());
        let templates: Vec<_> = (0..4)
            .map(|s| {
                let samples = (0..50).map(|i| (i * 4 + s, 0.0)).collect();
                ScriptedFetcher::new(&format!("s{s}"), samples).probe(Arc::clone(&probe))
            })
            .collect();
        let option = EngineOption::default()
            .max_simultaneous_points(8)
            .fetch_low_water_mark(1);
        let mut session = session(templates, option);

        let mut times = Vec::new();
        loop {
            let chunk = session.read(window_wide(), 7).await.expect("read");
            assert!(chunk.points.len() <= 7);
            times.extend(chunk.points.iter().map(|point| point.time.get()));
            assert!(session.buffered_points() <= 8);
            if chunk.is_final() {
                break;
            }
        }
        assert_eq!(times, (0..200).collect::<Vec<_>>());
        // Two points per page and four streams.
        assert!(session.metrics().peak_buffered_points <= 8);
        let page_sizes = probe.page_sizes();
        assert_eq!(page_sizes.len(), 100);
        assert!(page_sizes.iter().all(|&size| size == 2), "{page_sizes:?}");
    }

    fn window_wide() -> Window {
        Window::new(0, 1_000).expect("window")
    }

    #[tokio::test]
    async fn too_many_series_fails_the_session() {
        let option = EngineOption::default().max_series(2);
        let mut session = session(three_series(), option);

        let err = session.read(window(), 10).await.expect_err("cap exceeded");
        assert_eq!(err, ReadError::TooManySeries { limit: 2 });
        assert_eq!(
            session.read(window(), 10).await.expect_err("poisoned"),
            ReadError::Poisoned
        );
    }

    #[tokio::test]
    async fn fetch_failure_poisons_after_delivered_chunks() {
        let templates = vec![
            ScriptedFetcher::new("a", vec![(1, 0.0), (3, 0.0), (5, 0.0)]).fail_on_call(2),
            ScriptedFetcher::new("b", vec![(2, 0.0), (4, 0.0), (6, 0.0)]),
        ];
        let option = EngineOption::default().max_simultaneous_points(2);
        let mut session = session(templates, option);

        let first = session.read(window(), 1).await.expect("first chunk");
        assert_eq!(labels(&first.points), vec!["1a"]);

        let err = session.read(window(), 10).await.expect_err("refill fails");
        assert!(matches!(err, ReadError::Fetch(BackendError::Fetch(_))));
        assert_eq!(
            session.read(window(), 10).await.expect_err("poisoned"),
            ReadError::Poisoned
        );
    }

    #[tokio::test]
    async fn unavailable_backend_fails_before_enumeration() {
        let backend = Arc::new(ScriptedBackend::new(three_series()).unavailable("down"));
        let mut session =
            ReadSession::new(Arc::clone(&backend), EngineOption::default()).expect("session");

        let err = session.read(window(), 10).await.expect_err("startup fails");
        assert_eq!(
            err,
            ReadError::Backend(BackendError::Unavailable("down".to_string()))
        );
        assert_eq!(
            backend
                .enumerations
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn new_window_restarts_enumeration() {
        let backend = Arc::new(ScriptedBackend::new(three_series()));
        let mut session =
            ReadSession::new(Arc::clone(&backend), EngineOption::default()).expect("session");

        session.read(window(), 2).await.expect("first window");
        let other = Window::new(0, 20).expect("window");
        let chunk = session.read(other, 10).await.expect("second window");
        assert_eq!(labels(&chunk.points), vec!["1a", "2b", "3c", "4a", "5c"]);
        assert_eq!(chunk.read_end, Some(Timestamp::new(20)));
        assert_eq!(
            backend
                .enumerations
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn exhausted_stream_is_never_refetched() {
        let probe = Arc::new(FetchProbe::default());
        let templates = vec![
            ScriptedFetcher::new("a", vec![(1, 0.0)]).probe(Arc::clone(&probe)),
            ScriptedFetcher::new("b", (2..10).map(|t| (t, 0.0)).collect()),
        ];
        let option = EngineOption::default()
            .max_simultaneous_points(2)
            .fetch_low_water_mark(1);
        let mut session = session(templates, option);

        let chunk = session.read(window(), 100).await.expect("read");
        assert_eq!(chunk.points.len(), 9);
        assert!(chunk.is_final());
        // Stream `a` answered its single page with eof and was dropped.
        assert_eq!(probe.fetches(), 1);
    }

    #[tokio::test]
    async fn empty_window_drains_immediately() {
        let mut session = session(Vec::new(), EngineOption::default());
        let chunk = session.read(window(), 10).await.expect("read");
        assert!(chunk.points.is_empty());
        assert_eq!(chunk.read_end, Some(Timestamp::new(10)));
    }

    #[tokio::test]
    async fn zero_limit_emits_nothing() {
        let mut session = session(three_series(), EngineOption::default());
        let chunk = session.read(window(), 0).await.expect("read");
        assert!(chunk.points.is_empty());
        assert_eq!(chunk.read_end, None);
        let chunk = session.read(window(), 10).await.expect("read");
        assert_eq!(chunk.points.len(), 5);
    }

    #[tokio::test]
    async fn cancel_mid_fetch_completes_cleanly() {
        let gate = Arc::new(Semaphore::new(0));
        let probe = Arc::new(FetchProbe::default());
        let templates = vec![
            ScriptedFetcher::new("a", vec![(1, 0.0), (2, 0.0)])
                .gate(Arc::clone(&gate))
                .probe(Arc::clone(&probe)),
        ];
        let mut session = session(templates, EngineOption::default());
        let cancel = session.cancel_handle();

        let reader = tokio::spawn(async move {
            let chunk = session.read(window(), 10).await;
            (session, chunk)
        });
        while probe.fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        gate.add_permits(1);

        let (mut session, chunk) = reader.await.expect("join");
        let chunk = chunk.expect("cancellation is not an error");
        assert!(chunk.points.is_empty());
        assert_eq!(chunk.read_end, Some(Timestamp::new(10)));

        let again = session.read(window(), 10).await.expect("read after cancel");
        assert!(again.points.is_empty());
        assert!(again.is_final());
        assert_eq!(probe.fetches(), 1);
    }

    #[tokio::test]
    async fn fetch_failing_after_cancel_completes_cleanly() {
        let gate = Arc::new(Semaphore::new(0));
        let probe = Arc::new(FetchProbe::default());
        let templates = vec![ScriptedFetcher::new("a", vec![(1, 0.0)])
            .fail_on_call(1)
            .gate(Arc::clone(&gate))
            .probe(Arc::clone(&probe))];
        let mut session = session(templates, EngineOption::default());
        let cancel = session.cancel_handle();

        let reader = tokio::spawn(async move {
            let chunk = session.read(window(), 10).await;
            (session, chunk)
        });
        while probe.fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        gate.add_permits(1);

        let (mut session, chunk) = reader.await.expect("join");
        let chunk = chunk.expect("failure after cancellation is discarded");
        assert!(chunk.points.is_empty());
        assert_eq!(chunk.read_end, Some(Timestamp::new(10)));
        assert_eq!(session.state(), SessionState::Drained);

        let again = session.read(window(), 10).await.expect("not poisoned");
        assert!(again.is_final());
    }

    #[tokio::test]
    async fn chunks_stream_until_drained() {
        let session = session(three_series(), EngineOption::default());
        let chunks: Vec<Vec<Point>> = session
            .chunks(window(), 2)
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
