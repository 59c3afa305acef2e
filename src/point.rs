//! Time-series points, tag sets and read windows.

use std::{collections::BTreeMap, fmt, sync::Arc};

use thiserror::Error;

/// Point timestamp in a source-defined unit (milliseconds for [`crate::backend::mem`]).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Earliest representable timestamp.
    pub const MIN: Self = Self(i64::MIN);
    /// Latest representable timestamp.
    pub const MAX: Self = Self(i64::MAX);

    /// Construct a timestamp from a raw `i64`.
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw `i64` value backing this timestamp.
    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Subtract `delta` while saturating on overflow.
    #[inline]
    pub const fn saturating_sub(self, delta: i64) -> Self {
        Self(self.0.saturating_sub(delta))
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Timestamp").field(&self.0).finish()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag key/value pairs identifying one series.
pub type Tags = BTreeMap<String, String>;

/// A single time-stamped sample.
///
/// Points of one series share their tag set through an `Arc`, so tagging a
/// fetched page never copies the map.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Sample time. Ordering between points is defined by this field alone.
    pub time: Timestamp,
    /// Sample value.
    pub value: f64,
    /// Series tags.
    pub tags: Arc<Tags>,
}

impl Point {
    /// Untagged point.
    pub fn new(time: impl Into<Timestamp>, value: f64) -> Self {
        Self {
            time: time.into(),
            value,
            tags: Arc::default(),
        }
    }

    /// Point carrying the given shared tag set.
    pub fn tagged(time: impl Into<Timestamp>, value: f64, tags: Arc<Tags>) -> Self {
        Self {
            time: time.into(),
            value,
            tags,
        }
    }

    /// Look up a single tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Errors raised while constructing a [`Window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    /// Start lies after end.
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow {
        /// Requested start.
        start: Timestamp,
        /// Requested end.
        end: Timestamp,
    },
}

/// Half-open time range `[start, end)` a read session operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    start: Timestamp,
    end: Timestamp,
}

impl Window {
    /// Window covering `[start, end)`.
    pub fn new(
        start: impl Into<Timestamp>,
        end: impl Into<Timestamp>,
    ) -> Result<Self, WindowError> {
        let (start, end) = (start.into(), end.into());
        if start > end {
            return Err(WindowError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window ending at `now` and reaching `span` units back.
    pub fn last(now: impl Into<Timestamp>, span: i64) -> Self {
        let end = now.into();
        let start = end.saturating_sub(span.max(0));
        Self { start, end }
    }

    /// Inclusive lower bound.
    pub const fn start(&self) -> Timestamp {
        self.start
    }

    /// Exclusive upper bound.
    pub const fn end(&self) -> Timestamp {
        self.end
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}
