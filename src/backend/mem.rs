//! In-memory backend with fault injection.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;

use super::{Backend, BackendError, Fetcher, Page, SeriesQuery};
use crate::point::{Point, Tags, Timestamp};

type Series = BTreeMap<Tags, Vec<(Timestamp, f64)>>;

const NEVER: usize = usize::MAX;

#[derive(Debug)]
struct Faults {
    fetches: AtomicUsize,
    fail_fetch_at: AtomicUsize,
    failing_writes: AtomicUsize,
    unavailable: Mutex<Option<String>>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            fail_fetch_at: AtomicUsize::new(NEVER),
            failing_writes: AtomicUsize::new(0),
            unavailable: Mutex::new(None),
        }
    }
}

/// Backend keeping every series in process memory.
///
/// Series are keyed by `(space, tag set)` and kept sorted by time; equal
/// timestamps keep their insertion order.
#[derive(Debug, Default)]
pub struct MemBackend {
    spaces: Mutex<HashMap<String, Series>>,
    batches: Mutex<Vec<Vec<Point>>>,
    faults: Arc<Faults>,
}

impl MemBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one series directly, bypassing [`Backend::write`] bookkeeping.
    pub fn insert_series<I>(&self, space: &str, tags: Tags, samples: I)
    where
        I: IntoIterator<Item = (i64, f64)>,
    {
        let mut spaces = lock(&self.spaces);
        let series = spaces
            .entry(space.to_string())
            .or_default()
            .entry(tags)
            .or_default();
        series.extend(samples.into_iter().map(|(t, v)| (Timestamp::new(t), v)));
        series.sort_by_key(|(t, _)| *t);
    }

    /// Fail the `n`th fetch (1-based, counted across all fetchers).
    pub fn fail_fetch_number(&self, n: usize) {
        self.faults.fail_fetch_at.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` batch writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make [`Backend::startup`] fail with `reason`.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        *lock(&self.faults.unavailable) = Some(reason.into());
    }

    /// Number of fetch calls served so far, failures included.
    pub fn fetch_count(&self) -> usize {
        self.faults.fetches.load(Ordering::SeqCst)
    }

    /// Batches accepted by [`Backend::write`], in arrival order.
    pub fn written_batches(&self) -> Vec<Vec<Point>> {
        lock(&self.batches).clone()
    }

    /// Every stored point of `space`, ascending by time.
    pub fn points(&self, space: &str) -> Vec<Point> {
        let spaces = lock(&self.spaces);
        let mut points: Vec<Point> = spaces
            .get(space)
            .into_iter()
            .flat_map(|series| series.iter())
            .flat_map(|(tags, samples)| {
                let tags = Arc::new(tags.clone());
                samples
                    .iter()
                    .map(move |(t, v)| Point::tagged(*t, *v, Arc::clone(&tags)))
            })
            .collect();
        points.sort_by_key(|p| p.time);
        points
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn startup(&self) -> Result<(), BackendError> {
        match lock(&self.faults.unavailable).as_ref() {
            Some(reason) => Err(BackendError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn enumerate(&self, query: &SeriesQuery) -> Result<Vec<Box<dyn Fetcher>>, BackendError> {
        let spaces = lock(&self.spaces);
        let Some(series) = spaces.get(&query.space) else {
            return Ok(Vec::new());
        };
        let matching: Vec<_> = series
            .iter()
            .filter(|(tags, _)| query.filter.matches(tags))
            .collect();
        if matching.len() > query.series_limit {
            return Err(BackendError::TooManySeries {
                limit: query.series_limit,
            });
        }
        Ok(matching
            .into_iter()
            .map(|(tags, samples)| {
                let samples = samples
                    .iter()
                    .copied()
                    .filter(|(t, _)| query.window.contains(*t))
                    .collect();
                Box::new(MemFetcher {
                    tags: Arc::new(tags.clone()),
                    samples,
                    cursor: 0,
                    faults: Arc::clone(&self.faults),
                }) as Box<dyn Fetcher>
            })
            .collect())
    }

    async fn write(&self, points: Vec<Point>, space: &str) -> Result<(), BackendError> {
        let failing = self
            .faults
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BackendError::Write(format!(
                "injected failure writing {} points",
                points.len()
            )));
        }
        {
            let mut spaces = lock(&self.spaces);
            let series = spaces.entry(space.to_string()).or_default();
            for point in &points {
                series
                    .entry(point.tags.as_ref().clone())
                    .or_default()
                    .push((point.time, point.value));
            }
            for samples in series.values_mut() {
                samples.sort_by_key(|(t, _)| *t);
            }
        }
        lock(&self.batches).push(points);
        Ok(())
    }
}

/// Pages through a snapshot of one series taken at enumeration time.
struct MemFetcher {
    tags: Arc<Tags>,
    samples: Vec<(Timestamp, f64)>,
    cursor: usize,
    faults: Arc<Faults>,
}

#[async_trait]
impl Fetcher for MemFetcher {
    fn tags(&self) -> Arc<Tags> {
        Arc::clone(&self.tags)
    }

    async fn fetch(&mut self, page_size: usize) -> Result<Page, BackendError> {
        let number = self.faults.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if number == self.faults.fail_fetch_at.load(Ordering::SeqCst) {
            return Err(BackendError::Fetch(format!("injected failure on fetch {number}")));
        }
        let end = self
            .cursor
            .saturating_add(page_size.max(1))
            .min(self.samples.len());
        let points = self.samples[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Page {
            points,
            eof: self.cursor == self.samples.len(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
