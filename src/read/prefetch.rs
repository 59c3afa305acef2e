//! Bounded-concurrency refill of streams running low on buffered points.

use futures::{stream, StreamExt, TryStreamExt};

use crate::{backend::BackendError, read::stream::PagedStream};

/// Result of one refill round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RefillRound {
    /// Streams refilled.
    pub(crate) streams: usize,
    /// Points appended across those streams.
    pub(crate) points: usize,
}

/// Issues refills for every stream below the low-water mark, at most
/// `max_in_flight` at a time, and resolves once all of them finished.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrefetchScheduler {
    low_water_mark: usize,
    max_in_flight: usize,
}

impl PrefetchScheduler {
    pub(crate) fn new(low_water_mark: usize, max_in_flight: usize) -> Self {
        Self {
            low_water_mark: low_water_mark.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Number of streams the next [`PrefetchScheduler::refill`] would touch.
    pub(crate) fn eligible(&self, streams: &[PagedStream]) -> usize {
        streams
            .iter()
            .filter(|stream| stream.below_low_water(self.low_water_mark))
            .count()
    }

    /// Refill eligible streams concurrently.
    ///
    /// The first failure aborts the round and is returned; refills that had
    /// already completed keep their appended points. Each stream is borrowed
    /// by exactly one refill future, so no buffer is touched twice at once.
    pub(crate) async fn refill(
        &self,
        streams: &mut [PagedStream],
    ) -> Result<RefillRound, BackendError> {
        let low_water_mark = self.low_water_mark;
        let refills: Vec<_> = streams
            .iter_mut()
            .filter(|stream| stream.below_low_water(low_water_mark))
            .map(PagedStream::refill)
            .collect();
        let appended: Vec<usize> = stream::iter(refills)
            .buffer_unordered(self.max_in_flight)
            .try_collect()
            .await?;

        Ok(RefillRound {
            streams: appended.len(),
            points: appended.iter().sum(),
        })
    }
}
