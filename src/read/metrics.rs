//! Counters describing the work done by one read session.

use crate::read::prefetch::RefillRound;

/// Read session counters.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ReadMetrics {
    /// Merge passes performed.
    pub merge_passes: u64,
    /// Refill rounds issued through the prefetch scheduler.
    pub refill_rounds: u64,
    /// Pages fetched across all streams.
    pub pages_fetched: u64,
    /// Points appended to stream buffers.
    pub points_fetched: u64,
    /// Points handed to the caller.
    pub points_emitted: u64,
    /// Largest number of points buffered across all streams at once.
    pub peak_buffered_points: usize,
}

impl ReadMetrics {
    /// Record one merge pass.
    pub fn record_pass(&mut self) {
        self.merge_passes = self.merge_passes.saturating_add(1);
    }

    pub(crate) fn record_refill(&mut self, round: RefillRound, buffered: usize) {
        self.refill_rounds = self.refill_rounds.saturating_add(1);
        self.pages_fetched = self.pages_fetched.saturating_add(round.streams as u64);
        self.points_fetched = self.points_fetched.saturating_add(round.points as u64);
        self.peak_buffered_points = self.peak_buffered_points.max(buffered);
    }

    /// Record points returned by a `read` call.
    pub fn record_emitted(&mut self, points: usize) {
        self.points_emitted = self.points_emitted.saturating_add(points as u64);
    }
}
