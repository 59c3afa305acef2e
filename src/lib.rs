#![deny(missing_docs)]
//! Bounded-memory, time-ordered merge of paginated time series.
//!
//! A [`ReadSession`] merges any number of independently paged series into one
//! ascending stream of points, pulled in `limit`-sized chunks. Each series is
//! buffered through a page of at most `max_simultaneous_points / series`
//! points, so memory stays bounded by the configured budget no matter how
//! many points the window holds. A [`WriteBatcher`] is the companion sink: it
//! cuts incoming points into batches and writes them strictly one after the
//! other.
//!
//! Storage is reached only through the [`backend::Backend`] and
//! [`backend::Fetcher`] traits; [`backend::mem::MemBackend`] keeps everything
//! in process memory.

mod logging;

#[cfg(test)]
mod test_util;

/// Storage collaborator contracts and the in-memory backend.
pub mod backend;

/// Runtime abstraction for background work.
pub mod executor;

/// Engine configuration.
pub mod option;

/// Points, tags, timestamps and windows.
pub mod point;

/// Incremental k-way merge read path.
pub mod read;

/// Batched write path.
pub mod write;

pub use crate::{
    backend::{Backend, BackendError, Fetcher, Page, SeriesFilter, SeriesQuery},
    option::{ConfigError, EngineOption},
    point::{Point, Tags, Timestamp, Window, WindowError},
    read::{ReadChunk, ReadError, ReadSession, SessionState},
    write::{FlushTicket, WriteBatcher, WriteError},
};
