//! When to poll a feed next.
//!
//! Everything here is a pure function of the feed record and the clock.

use chrono::{DateTime, Duration, Utc};

use crate::config::ScheduleConfig;
use crate::storage::{time_max, Feed};

/// Weight of the newest observed interval in the moving average.
const AVERAGE_WEIGHT: f64 = 0.1;

/// Next-due policy derived from [`ScheduleConfig`].
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub default_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub push_recheck: Duration,
    pub backoff_cap_hours: u32,
    pub not_viewed_after: Duration,
}

impl From<&ScheduleConfig> for SchedulePolicy {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            default_interval: config.default_interval(),
            min_interval: config.min_interval(),
            max_interval: config.max_interval(),
            push_recheck: config.push_recheck(),
            backoff_cap_hours: config.backoff_cap_hours,
            not_viewed_after: config.not_viewed_after(),
        }
    }
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl SchedulePolicy {
    /// Next-due time for `feed` as of `now`.
    ///
    /// Feeds nobody reads are parked at the year-3000 sentinel. Failing feeds
    /// back off. Healthy feeds poll at their observed cadence within
    /// `[min_interval, max_interval]`, and a push caps the wait at
    /// `push_recheck`.
    pub fn next_update(&self, feed: &Feed, now: DateTime<Utc>, from_push: bool) -> DateTime<Utc> {
        if !feed.is_viewed(now, self.not_viewed_after) {
            return time_max();
        }

        if feed.errors > 0 {
            return now + backoff_delay(feed.errors - 1, self.backoff_cap_hours);
        }

        let interval = if feed.average <= Duration::zero() {
            self.default_interval
        } else {
            feed.average
        };
        let interval = interval.clamp(self.min_interval, self.max_interval);
        let next = now + interval;

        if from_push {
            next.min(now + self.push_recheck)
        } else {
            next
        }
    }
}

/// Retry delay after a failure, given the error count before it.
///
/// `min(previous_errors, cap)` hours: a first failure retries right away,
/// then 1h, 2h, ... up to the cap.
pub fn backoff_delay(previous_errors: u32, cap_hours: u32) -> Duration {
    Duration::hours(i64::from(previous_errors.min(cap_hours)))
}

/// Folds the interval since `previous` (spread over `written` new stories)
/// into the moving average.
pub fn update_average(
    average: Duration,
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    written: usize,
) -> Duration {
    let Some(previous) = previous else {
        return average;
    };
    if written == 0 || now <= previous {
        return average;
    }

    let count = i32::try_from(written).unwrap_or(i32::MAX);
    let interval = (now - previous) / count;
    if average <= Duration::zero() {
        return interval;
    }

    let blended = average.num_milliseconds() as f64 * (1.0 - AVERAGE_WEIGHT)
        + interval.num_milliseconds() as f64 * AVERAGE_WEIGHT;
    Duration::milliseconds(blended.round() as i64)
}
