//! Counters describing the work done by one write session.

/// Write session counters.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct WriteMetrics {
    /// Batches handed to the backend successfully.
    pub flushes: u64,
    /// Points contained in those batches.
    pub points_flushed: u64,
    /// Batches the backend rejected.
    pub failed_flushes: u64,
    /// Points dropped with rejected batches.
    pub points_lost: u64,
    /// Largest batch swapped out of the buffer.
    pub largest_batch: usize,
}

impl WriteMetrics {
    /// Record a successful batch write.
    pub fn record_flush(&mut self, points: usize) {
        self.flushes = self.flushes.saturating_add(1);
        self.points_flushed = self.points_flushed.saturating_add(points as u64);
        self.largest_batch = self.largest_batch.max(points);
    }

    /// Record a rejected batch.
    pub fn record_failure(&mut self, points: usize) {
        self.failed_flushes = self.failed_flushes.saturating_add(1);
        self.points_lost = self.points_lost.saturating_add(points as u64);
        self.largest_batch = self.largest_batch.max(points);
    }
}
