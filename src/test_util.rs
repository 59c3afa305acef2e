//! Scripted collaborators shared by unit tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    backend::{Backend, BackendError, Fetcher, Page, SeriesQuery},
    point::{Point, Tags, Timestamp},
};

/// Counters observed across every fetcher cloned from one template set.
#[derive(Debug, Default)]
pub(crate) struct FetchProbe {
    pub(crate) fetches: AtomicUsize,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) peak_in_flight: AtomicUsize,
    pub(crate) page_sizes: Mutex<Vec<usize>>,
}

impl FetchProbe {
    fn enter(&self, page_size: usize) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.page_sizes
            .lock()
            .expect("probe lock")
            .push(page_size);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Page sizes requested so far, in call order.
    pub(crate) fn page_sizes(&self) -> Vec<usize> {
        self.page_sizes.lock().expect("probe lock").clone()
    }
}

/// Fetcher replaying a fixed sample list in pages of the requested size.
#[derive(Clone)]
pub(crate) struct ScriptedFetcher {
    tags: Arc<Tags>,
    samples: Vec<(Timestamp, f64)>,
    cursor: usize,
    calls: usize,
    fail_on_call: Option<usize>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    probe: Arc<FetchProbe>,
}

impl ScriptedFetcher {
    /// Series tagged `series=<name>`.
    pub(crate) fn new(series: &str, samples: Vec<(i64, f64)>) -> Self {
        Self {
            tags: Arc::new([("series".to_string(), series.to_string())].into()),
            samples: samples
                .into_iter()
                .map(|(t, v)| (Timestamp::new(t), v))
                .collect(),
            cursor: 0,
            calls: 0,
            fail_on_call: None,
            delay: None,
            gate: None,
            probe: Arc::default(),
        }
    }

    /// Fail the `n`th fetch (1-based) of this fetcher.
    pub(crate) fn fail_on_call(self, n: usize) -> Self {
        Self {
            fail_on_call: Some(n),
            ..self
        }
    }

    pub(crate) fn delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Every fetch waits for a permit from `gate` before answering.
    pub(crate) fn gate(self, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..self
        }
    }

    pub(crate) fn probe(self, probe: Arc<FetchProbe>) -> Self {
        Self { probe, ..self }
    }

    pub(crate) fn boxed(self) -> Box<dyn Fetcher> {
        Box::new(self)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn tags(&self) -> Arc<Tags> {
        Arc::clone(&self.tags)
    }

    async fn fetch(&mut self, page_size: usize) -> Result<Page, BackendError> {
        self.calls += 1;
        self.probe.enter(page_size);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.probe.exit();
        if self.fail_on_call == Some(self.calls) {
            return Err(BackendError::Fetch(format!("scripted failure on call {}", self.calls)));
        }
        let end = (self.cursor + page_size.max(1)).min(self.samples.len());
        let points = self.samples[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Page {
            points,
            eof: self.cursor == self.samples.len(),
        })
    }
}

/// Backend handing out clones of template fetchers and recording writes.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    templates: Vec<ScriptedFetcher>,
    pub(crate) enumerations: AtomicUsize,
    unavailable: Option<String>,
    write_delay: Option<Duration>,
    failing_batches: HashSet<usize>,
    writes_started: AtomicUsize,
    writes_in_flight: AtomicUsize,
    peak_writes_in_flight: AtomicUsize,
    batches: Mutex<Vec<Vec<Point>>>,
}

impl ScriptedBackend {
    pub(crate) fn new(templates: Vec<ScriptedFetcher>) -> Self {
        Self {
            templates,
            ..Self::default()
        }
    }

    pub(crate) fn unavailable(self, reason: &str) -> Self {
        Self {
            unavailable: Some(reason.to_string()),
            ..self
        }
    }

    pub(crate) fn write_delay(self, delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..self
        }
    }

    /// Fail the batch writes with these 1-based sequence numbers.
    pub(crate) fn failing_batches(self, batches: &[usize]) -> Self {
        Self {
            failing_batches: batches.iter().copied().collect(),
            ..self
        }
    }

    /// Batches that were written successfully.
    pub(crate) fn batches(&self) -> Vec<Vec<Point>> {
        self.batches.lock().expect("batches lock").clone()
    }

    pub(crate) fn peak_writes_in_flight(&self) -> usize {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn startup(&self) -> Result<(), BackendError> {
        match &self.unavailable {
            Some(reason) => Err(BackendError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn enumerate(&self, query: &SeriesQuery) -> Result<Vec<Box<dyn Fetcher>>, BackendError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.templates.len() > query.series_limit {
            return Err(BackendError::TooManySeries {
                limit: query.series_limit,
            });
        }
        Ok(self
            .templates
            .iter()
            .cloned()
            .map(ScriptedFetcher::boxed)
            .collect())
    }

    async fn write(&self, points: Vec<Point>, _space: &str) -> Result<(), BackendError> {
        let seq = self.writes_started.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing_batches.contains(&seq) {
            return Err(BackendError::Write(format!("scripted failure on batch {seq}")));
        }
        self.batches.lock().expect("batches lock").push(points);
        Ok(())
    }
}

/// Points stamped `start..end` with the value mirroring the time.
pub(crate) fn ramp(start: i64, end: i64) -> Vec<Point> {
    (start..end).map(|t| Point::new(t, t as f64)).collect()
}
