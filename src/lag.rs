//! Replication lag tracking.
//!
//! Lag is measured on every Begin as the distance between the transaction's
//! commit time and the local clock. Two independent flags follow it: the
//! warning flag only changes log output, the error flag makes the session
//! stop invoking downstream hooks until lag recovers.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{error, info, warn};

/// Flag flips produced by one observation. `Some(true)` means the
/// threshold was crossed upwards, `Some(false)` that lag dropped back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LagTransitions {
    pub warning: Option<bool>,
    pub error: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LagMonitor {
    warning_threshold: Duration,
    error_threshold: Duration,
    warning_threshold_exceeded: bool,
    error_threshold_exceeded: bool,
    last_lag: Duration,
}

impl LagMonitor {
    pub fn new(warning_threshold: Duration, error_threshold: Duration) -> Self {
        Self {
            warning_threshold,
            error_threshold,
            warning_threshold_exceeded: false,
            error_threshold_exceeded: false,
            last_lag: Duration::ZERO,
        }
    }

    /// Evaluates lag for a transaction committed at `commit_time`.
    ///
    /// A commit time ahead of `now` (clock skew) counts as zero lag.
    pub fn observe(&mut self, commit_time: DateTime<Utc>, now: DateTime<Utc>) -> LagTransitions {
        let lag = (now - commit_time).to_std().unwrap_or(Duration::ZERO);
        self.observe_lag(lag)
    }

    pub fn observe_lag(&mut self, lag: Duration) -> LagTransitions {
        self.last_lag = lag;
        let lag_ms = lag.as_millis() as u64;
        let mut transitions = LagTransitions::default();

        let warning = lag >= self.warning_threshold;
        if warning != self.warning_threshold_exceeded {
            self.warning_threshold_exceeded = warning;
            transitions.warning = Some(warning);
            if warning {
                warn!(
                    lag_ms,
                    threshold_ms = self.warning_threshold.as_millis() as u64,
                    "Replication lag exceeded warning threshold"
                );
            } else {
                info!(lag_ms, "Replication lag back below warning threshold");
            }
        }

        let error = lag >= self.error_threshold;
        if error != self.error_threshold_exceeded {
            self.error_threshold_exceeded = error;
            transitions.error = Some(error);
            if error {
                error!(
                    lag_ms,
                    threshold_ms = self.error_threshold.as_millis() as u64,
                    "Replication lag exceeded error threshold, skipping downstream hooks"
                );
            } else {
                info!(
                    lag_ms,
                    "Replication lag back below error threshold, resuming downstream hooks"
                );
            }
        }

        transitions
    }

    pub fn warning_threshold_exceeded(&self) -> bool {
        self.warning_threshold_exceeded
    }

    pub fn error_threshold_exceeded(&self) -> bool {
        self.error_threshold_exceeded
    }

    /// Lag measured at the most recent Begin.
    pub fn last_lag(&self) -> Duration {
        self.last_lag
    }
}
