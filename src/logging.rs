//! Internal logging helpers for structured merge and write events.

/// Single logging target for the crate.
pub(crate) const LOG_TARGET: &str = "tidemerge";

/// Common key/value fields appended to all logs emitted by one session.
#[derive(Clone, Debug)]
pub(crate) struct LogContext {
    common_kv: String,
}

impl LogContext {
    /// Build a context that appends the provided key/value pairs.
    pub(crate) fn new(common_kv: impl Into<String>) -> Self {
        Self {
            common_kv: common_kv.into(),
        }
    }

    /// Context tagging every line with a session component and id.
    pub(crate) fn session(component: &str, id: ulid::Ulid) -> Self {
        Self::new(format!("component={component} session={id}"))
    }

    pub(crate) fn common_kv(&self) -> Option<&str> {
        if self.common_kv.is_empty() {
            None
        } else {
            Some(self.common_kv.as_str())
        }
    }
}

macro_rules! tidemerge_log {
    ($level:expr, ctx: $ctx:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            if let Some(common_kv) = $ctx.common_kv() {
                log::log!(
                    target: crate::logging::LOG_TARGET,
                    $level,
                    "event={} {} {}",
                    $event,
                    common_kv,
                    format_args!($fmt $(, $args)*)
                );
            } else {
                log::log!(
                    target: crate::logging::LOG_TARGET,
                    $level,
                    "event={} {}",
                    $event,
                    format_args!($fmt $(, $args)*)
                );
            }
        }
    }};
    ($level:expr, $event:expr, $fmt:expr $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} {}",
                $event,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use tidemerge_log;
