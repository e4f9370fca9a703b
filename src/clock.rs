//! C1: Clock & TimeWindow (`spec.md` §4.1).
//!
//! All components obtain time from this interface rather than calling
//! `Utc::now()` directly, so tests can inject a virtual clock — this is
//! what makes scenario S6 ("after 30 days") expressible without sleeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Source of truth for "now", injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for tests and for simulating long waits (e.g. scenario
/// S6's "after 30 days (virtual clock)").
#[derive(Clone)]
pub struct VirtualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl VirtualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Arc::new(RwLock::new(start)) }
    }

    pub async fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.current.write().await;
        *guard += delta;
    }

    pub async fn set(&self, when: DateTime<Utc>) {
        let mut guard = self.current.write().await;
        *guard = when;
    }

    #[must_use]
    pub fn now_blocking(&self) -> DateTime<Utc> {
        *self.current.blocking_read()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        self.current.try_read().map_or_else(|_| Utc::now(), |guard| *guard)
    }
}

/// Whether `now` (in `zone`) falls within a local-time window, handling
/// wrap-around windows such as 22→02 (`spec.md` §4.1, §8 boundary case).
#[must_use]
pub fn in_window(now: DateTime<Utc>, start_hour: u32, end_hour: u32, zone: &chrono_tz::Tz) -> bool {
    let local = now.with_timezone(zone);
    let hour = local.hour_of_day();

    if start_hour <= end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        // Wrap-around window, e.g. 22 -> 02.
        hour >= start_hour || hour < end_hour
    }
}

trait HourOfDay {
    fn hour_of_day(&self) -> u32;
}

impl<Tz: chrono::TimeZone> HourOfDay for DateTime<Tz> {
    fn hour_of_day(&self) -> u32 {
        use chrono::Timelike;
        self.hour()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn plain_window_within_bounds() {
        assert!(in_window(at(5), 4, 6, &chrono_tz::UTC));
        assert!(!in_window(at(7), 4, 6, &chrono_tz::UTC));
    }

    #[test]
    fn wrap_around_window_crosses_midnight() {
        // 22 -> 02 maintenance window.
        assert!(in_window(at(23), 22, 2, &chrono_tz::UTC));
        assert!(in_window(at(1), 22, 2, &chrono_tz::UTC));
        assert!(!in_window(at(12), 22, 2, &chrono_tz::UTC));
    }

    #[tokio::test]
    async fn virtual_clock_advances() {
        let start = at(0);
        let clock = VirtualClock::new(start);
        clock.advance(chrono::Duration::days(30)).await;
        assert_eq!(clock.now(), start + chrono::Duration::days(30));
    }
}
