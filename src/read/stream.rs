//! Buffered view over one paginated series.

use std::{collections::VecDeque, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    backend::{BackendError, Fetcher},
    point::{Point, Tags, Timestamp},
};

/// Contract violations on a [`PagedStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// `peek_time`/`pop` on a stream whose buffer is empty.
    #[error("peek or pop on an empty stream buffer")]
    EmptyBuffer,
}

/// One series' fetcher plus the points fetched from it but not yet merged.
///
/// The buffer stays ascending by time: each page is time-ordered and pages are
/// appended in fetch order.
pub(crate) struct PagedStream {
    fetcher: Box<dyn Fetcher>,
    tags: Arc<Tags>,
    fetch_size: usize,
    buffer: VecDeque<Point>,
    more_upstream: bool,
}

impl PagedStream {
    pub(crate) fn new(fetcher: Box<dyn Fetcher>, fetch_size: usize) -> Self {
        let tags = fetcher.tags();
        Self {
            fetcher,
            tags,
            fetch_size: fetch_size.max(1),
            buffer: VecDeque::new(),
            more_upstream: true,
        }
    }

    pub(crate) fn peek_time(&self) -> Result<Timestamp, StreamError> {
        self.buffer
            .front()
            .map(|point| point.time)
            .ok_or(StreamError::EmptyBuffer)
    }

    pub(crate) fn pop(&mut self) -> Result<Point, StreamError> {
        self.buffer.pop_front().ok_or(StreamError::EmptyBuffer)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn needs_refill(&self) -> bool {
        self.more_upstream
    }

    /// Drained and nothing left upstream.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && !self.more_upstream
    }

    /// Eligible for the next refill round.
    pub(crate) fn below_low_water(&self, low_water_mark: usize) -> bool {
        self.more_upstream && self.buffer.len() < low_water_mark
    }

    /// Fetch one page and append it; returns the number of points added.
    ///
    /// Nothing is mutated until the fetch succeeded, so a failed refill leaves
    /// the stream as it was.
    pub(crate) async fn refill(&mut self) -> Result<usize, BackendError> {
        let page = self.fetcher.fetch(self.fetch_size).await?;
        let fetched = page.points.len();
        let tags = &self.tags;
        self.buffer.extend(
            page.points
                .into_iter()
                .map(|(time, value)| Point::tagged(time, value, Arc::clone(tags))),
        );
        self.more_upstream = !page.eof;
        Ok(fetched)
    }
}

impl fmt::Debug for PagedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedStream")
            .field("tags", &self.tags)
            .field("fetch_size", &self.fetch_size)
            .field("buffered", &self.buffer.len())
            .field("more_upstream", &self.more_upstream)
            .finish()
    }
}
