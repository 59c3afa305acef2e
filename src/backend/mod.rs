//! Contracts for the storage collaborators the engine reads from and writes to.
//!
//! The engine never looks behind these traits: series enumeration, paging and
//! durable writes are the backend's business. [`mem::MemBackend`] is an
//! in-process implementation used for embedding and tests.

pub mod mem;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::point::{Point, Tags, Timestamp, Window};

/// Space used when the caller does not name one.
pub const DEFAULT_SPACE: &str = "default";

/// Errors surfaced by backend collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The query matched more series than allowed.
    #[error("query matched more than {limit} series")]
    TooManySeries {
        /// Configured series cap.
        limit: usize,
    },
    /// The backend is not reachable or failed to start.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A page fetch failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// A batch write failed.
    #[error("write failed: {0}")]
    Write(String),
}

/// One page of a series, ascending by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Samples of the page.
    pub points: Vec<(Timestamp, f64)>,
    /// No more pages follow.
    pub eof: bool,
}

/// Paginated reader over one logical series.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Tag set merged into every point of this series.
    fn tags(&self) -> Arc<Tags>;

    /// Fetch the next page holding at most `page_size` points.
    async fn fetch(&mut self, page_size: usize) -> Result<Page, BackendError>;
}

/// Conjunction of tag equality matches selecting series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesFilter {
    matches: Tags,
}

impl SeriesFilter {
    /// Filter selecting every series.
    pub fn all() -> Self {
        Self::default()
    }

    /// Additionally require `key == value`.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matches.insert(key.into(), value.into());
        self
    }

    /// Whether a series tagged `tags` is selected.
    pub fn matches(&self, tags: &Tags) -> bool {
        self.matches
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

/// Series enumeration request for one read window.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    /// Series selection.
    pub filter: SeriesFilter,
    /// Logical space to read from.
    pub space: String,
    /// Time range of interest.
    pub window: Window,
    /// Enumeration fails when more series than this match.
    pub series_limit: usize,
}

/// Storage backend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Resolves once the backend accepts requests.
    async fn startup(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// One fetcher per series matching `query`.
    async fn enumerate(&self, query: &SeriesQuery) -> Result<Vec<Box<dyn Fetcher>>, BackendError>;

    /// Persist an arbitrary-order batch of points into `space`.
    async fn write(&self, points: Vec<Point>, space: &str) -> Result<(), BackendError>;
}
