use thiserror::Error;

/// Default cap on series enumerated for one window.
pub const DEFAULT_MAX_SERIES: usize = 20_000;
/// Default budget of points buffered across all streams of one session.
pub const DEFAULT_MAX_SIMULTANEOUS_POINTS: usize = 100_000;
/// Default buffer occupancy below which a stream is refilled.
pub const DEFAULT_FETCH_LOW_WATER_MARK: usize = 3;
/// Default fan-out of concurrent refills.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 100;
/// Default number of buffered writes that triggers a flush.
pub const DEFAULT_WRITE_FLUSH_THRESHOLD: usize = 100;

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A knob that must be positive was set to zero.
    #[error("config option `{0}` must be greater than zero")]
    Zero(&'static str),
}

/// Tuning knobs shared by read and write sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOption {
    pub(crate) max_series: usize,
    pub(crate) max_simultaneous_points: usize,
    pub(crate) fetch_low_water_mark: usize,
    pub(crate) max_concurrent_fetches: usize,
    pub(crate) write_flush_threshold: usize,
}

impl Default for EngineOption {
    fn default() -> Self {
        EngineOption {
            max_series: DEFAULT_MAX_SERIES,
            max_simultaneous_points: DEFAULT_MAX_SIMULTANEOUS_POINTS,
            fetch_low_water_mark: DEFAULT_FETCH_LOW_WATER_MARK,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            write_flush_threshold: DEFAULT_WRITE_FLUSH_THRESHOLD,
        }
    }
}

impl EngineOption {
    /// Cap on the number of series one window may enumerate.
    pub fn max_series(self, max_series: usize) -> Self {
        EngineOption { max_series, ..self }
    }

    /// Total point budget split evenly across the streams of a session.
    pub fn max_simultaneous_points(self, max_simultaneous_points: usize) -> Self {
        EngineOption {
            max_simultaneous_points,
            ..self
        }
    }

    /// Buffer occupancy below which a stream is scheduled for refill.
    pub fn fetch_low_water_mark(self, fetch_low_water_mark: usize) -> Self {
        EngineOption {
            fetch_low_water_mark,
            ..self
        }
    }

    /// Maximum number of refills in flight at once.
    pub fn max_concurrent_fetches(self, max_concurrent_fetches: usize) -> Self {
        EngineOption {
            max_concurrent_fetches,
            ..self
        }
    }

    /// Buffered write count above which a flush is triggered.
    pub fn write_flush_threshold(self, write_flush_threshold: usize) -> Self {
        EngineOption {
            write_flush_threshold,
            ..self
        }
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// A zero low-water mark would leave an empty stream ineligible for
    /// refill, stalling the merge.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let knobs = [
            ("max_series", self.max_series),
            ("max_simultaneous_points", self.max_simultaneous_points),
            ("fetch_low_water_mark", self.fetch_low_water_mark),
            ("max_concurrent_fetches", self.max_concurrent_fetches),
        ];
        match knobs.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }

    /// Page size handed to each of `series` streams.
    pub fn fetch_size_for(&self, series: usize) -> usize {
        (self.max_simultaneous_points / series.max(1)).max(1)
    }

    /// See [`EngineOption::max_series`].
    pub fn get_max_series(&self) -> usize {
        self.max_series
    }

    /// See [`EngineOption::fetch_low_water_mark`].
    pub fn get_fetch_low_water_mark(&self) -> usize {
        self.fetch_low_water_mark
    }

    /// See [`EngineOption::max_concurrent_fetches`].
    pub fn get_max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    /// See [`EngineOption::write_flush_threshold`].
    pub fn get_write_flush_threshold(&self) -> usize {
        self.write_flush_threshold
    }
}
