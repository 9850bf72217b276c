//! Fleet-wide fixed window computation.
//!
//! Windows are counted from a hard-coded epoch so that every node, whatever
//! its uptime, derives the same window id and end instant from the same wall
//! clock reading.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Unix timestamp of 2000-01-01T00:00:00Z, the origin all windows count from.
pub const WINDOW_EPOCH_UNIX_SECS: i64 = 946_684_800;

/// A half-open interval `[start, end)` of one configured window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    /// Number of whole windows elapsed since the epoch
    id: u64,
    /// Window length in whole seconds (never zero)
    duration_secs: u64,
}

impl Window {
    /// Compute the window containing `now`.
    ///
    /// Sub-second window lengths are rounded up to one second. Instants before
    /// the epoch fall into window 0.
    pub fn containing(now: DateTime<Utc>, duration: Duration) -> Self {
        let duration_secs = duration.as_secs().max(1);
        let elapsed = now.timestamp().saturating_sub(WINDOW_EPOCH_UNIX_SECS).max(0) as u64;

        Self {
            id: elapsed / duration_secs,
            duration_secs,
        }
    }

    /// Window id, stable across nodes for the same wall-clock window.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Window length in seconds.
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    /// Window length.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// First instant inside the window.
    pub fn start(&self) -> DateTime<Utc> {
        epoch_offset(self.id.saturating_mul(self.duration_secs))
    }

    /// First instant after the window, i.e. when its usage record expires.
    pub fn end(&self) -> DateTime<Utc> {
        epoch_offset(self.id.saturating_add(1).saturating_mul(self.duration_secs))
    }

    /// Time left until the window closes, as seen from `now`.
    pub fn remaining_from(&self, now: DateTime<Utc>) -> Duration {
        (self.end() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// The window that immediately follows this one.
    pub fn next(&self) -> Self {
        Self {
            id: self.id.saturating_add(1),
            duration_secs: self.duration_secs,
        }
    }
}

fn epoch_offset(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| WINDOW_EPOCH_UNIX_SECS.checked_add(secs))
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Format an instant the way HTTP `Retry-After` and `Date` headers expect.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_same_window_is_deterministic() {
        let minute = Duration::from_secs(60);
        let a = Window::containing(at(5, 0, 0), minute);
        let b = Window::containing(at(5, 0, 59), minute);
        let c = Window::containing(
            at(5, 0, 30) + chrono::Duration::milliseconds(999),
            minute,
        );

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.end(), b.end());
    }

    #[test]
    fn test_boundary_belongs_to_new_window() {
        let minute = Duration::from_secs(60);
        let before = Window::containing(at(5, 0, 59) + chrono::Duration::milliseconds(999), minute);
        let boundary = Window::containing(at(5, 1, 0), minute);

        assert_eq!(boundary.id(), before.id() + 1);
        assert_eq!(boundary.start(), at(5, 1, 0));
        assert_eq!(before.end(), boundary.start());
        assert_eq!(before.next(), boundary);
    }

    #[test]
    fn test_window_end_is_epoch_aligned() {
        let window = Window::containing(at(5, 0, 10), Duration::from_secs(60));
        assert_eq!(window.start(), at(5, 0, 0));
        assert_eq!(window.end(), at(5, 1, 0));
        assert_eq!(window.remaining_from(at(5, 0, 10)), Duration::from_secs(50));
    }

    #[test]
    fn test_window_id_counts_from_epoch() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Window::containing(epoch, Duration::from_secs(60)).id(), 0);

        let hour_later = Utc.with_ymd_and_hms(2000, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(Window::containing(hour_later, Duration::from_secs(60)).id(), 60);
        assert_eq!(Window::containing(hour_later, Duration::from_secs(3600)).id(), 1);
    }

    #[test]
    fn test_window_id_monotonic() {
        let window = Duration::from_secs(7);
        let mut last = 0;
        for offset in 0..100 {
            let id = Window::containing(at(12, 0, 0) + chrono::Duration::seconds(offset), window).id();
            assert!(id >= last);
            last = id;
        }
    }

    #[test]
    fn test_before_epoch_clamps_to_zero() {
        let old = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Window::containing(old, Duration::from_secs(60)).id(), 0);
    }

    #[test]
    fn test_zero_duration_rounds_up() {
        let window = Window::containing(at(0, 0, 0), Duration::ZERO);
        assert_eq!(window.duration_secs(), 1);
    }

    #[test]
    fn test_http_date_format() {
        let end = Window::containing(at(5, 0, 10), Duration::from_secs(60)).end();
        assert_eq!(http_date(end), "Thu, 14 Mar 2024 05:01:00 GMT");
    }
}
