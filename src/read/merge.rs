//! Single k-way merge pass over the buffered heads of a session's streams.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use crate::{
    point::{Point, Timestamp},
    read::stream::{PagedStream, StreamError},
};

/// Why a merge pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassOutcome {
    /// Every stream drained with nothing left upstream.
    Exhausted,
    /// The output reached its limit.
    LimitReached,
    /// A stream ran dry while more data exists upstream; merging further
    /// could emit points out of order.
    NeedsRefill,
}

/// Merge buffered points from `streams` into `out` until it holds `limit`
/// points or a stream must be refilled first.
///
/// Every stream must be non-empty on entry. The heap stores stream indices
/// keyed by head time, so streams stay owned by the caller's vector and
/// drained streams are removed by the caller afterwards.
pub(crate) fn merge_pass(
    streams: &mut [PagedStream],
    limit: usize,
    out: &mut Vec<Point>,
) -> Result<PassOutcome, StreamError> {
    if out.len() >= limit {
        return Ok(PassOutcome::LimitReached);
    }
    let mut heap = BinaryHeap::with_capacity(streams.len());
    for (stream_idx, stream) in streams.iter().enumerate() {
        heap.push(Reverse(HeapEntry::new(stream.peek_time()?, stream_idx)));
    }

    while let Some(Reverse(entry)) = heap.pop() {
        let stream = &mut streams[entry.stream_idx];
        let next_time = heap.peek().map(|Reverse(next)| next.time);

        while out.len() < limit && !stream.is_empty() {
            let head = stream.peek_time()?;
            if next_time.is_some_and(|next| head > next) {
                break;
            }
            out.push(stream.pop()?);
        }

        if out.len() >= limit {
            return Ok(PassOutcome::LimitReached);
        }
        if !stream.is_empty() {
            heap.push(Reverse(HeapEntry::new(stream.peek_time()?, entry.stream_idx)));
        } else if stream.needs_refill() {
            return Ok(PassOutcome::NeedsRefill);
        }
        // Drained for good: falls out of the heap.
    }
    Ok(PassOutcome::Exhausted)
}

/// Heap slot: a stream index keyed by the time of its buffered head.
#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    time: Timestamp,
    stream_idx: usize,
}

impl HeapEntry {
    fn new(time: Timestamp, stream_idx: usize) -> Self {
        Self { time, stream_idx }
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Index breaks ties so equal heads pop in a stable order.
        self.time
            .cmp(&other.time)
            .then(self.stream_idx.cmp(&other.stream_idx))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}
