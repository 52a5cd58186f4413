//! Next-push delay computation.
//!
//! Delay resolution order: server-recommended interval, then the configured
//! polling interval, then the hard default. A retry reschedule is clamped to
//! the short retry delay regardless, and every result is floored at one
//! minute. The pipeline arms exactly one pending deadline; re-arming
//! replaces it.

use std::time::Duration;

use crate::config::{EffectiveSettings, DEFAULT_SYNC_INTERVAL_MINUTES};

/// Failed pushes retry after at most this many minutes.
pub const RETRY_DELAY_MINUTES: u64 = 5;
/// No delay may be shorter than this.
pub const MIN_DELAY_MINUTES: u64 = 1;

/// Inputs to one rescheduling decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleRequest {
    /// `nextRecommendedCheckMinutes` echoed by the server, when present.
    pub recommended_delay_minutes: Option<u64>,
    /// The previous attempt failed; clamp to the retry delay.
    pub retry: bool,
}

/// Minutes until the next transmission attempt.
pub fn next_delay_minutes(settings: &EffectiveSettings, request: &ScheduleRequest) -> u64 {
    let base = match request.recommended_delay_minutes {
        Some(minutes) if minutes > 0 => minutes,
        _ => {
            if settings.sync_interval_minutes > 0 {
                settings.sync_interval_minutes
            } else {
                DEFAULT_SYNC_INTERVAL_MINUTES
            }
        }
    };

    let clamped = if request.retry {
        base.min(RETRY_DELAY_MINUTES)
    } else {
        base
    };

    clamped.max(MIN_DELAY_MINUTES)
}

pub fn next_delay(settings: &EffectiveSettings, request: &ScheduleRequest) -> Duration {
    Duration::from_secs(next_delay_minutes(settings, request) * 60)
}
