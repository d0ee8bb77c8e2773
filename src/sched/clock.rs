//! Millisecond-resolution monotonic dates and a virtualizable clock source.
//!
//! Production code runs on the real clock (backed by `tokio::time::Instant`
//! so that paused-runtime tests still behave); deterministic scenario tests
//! run on a virtual clock that only moves when explicitly advanced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::{ErrorCode, ReplSetError};

use serde::{Deserialize, Serialize};

use tokio::time::Instant;

/// Both clock flavors start here rather than at zero, so that the zero date
/// stays a reliable "unset" sentinel.
const CLOCK_BASE_MS: u64 = 1000;

/// A point on the coordinator's monotonic timeline, in milliseconds. The
/// zero date is a distinguished "unset" value that no running clock ever
/// reports.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Copy,
    Clone,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Date(pub u64);

impl Date {
    /// The distinguished unset date.
    pub const ZERO: Date = Date(0);

    /// True if this is the unset date.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns this date shifted forward by the given milliseconds.
    #[inline]
    pub fn plus_millis(self, ms: u64) -> Date {
        Date(self.0 + ms)
    }

    /// Milliseconds elapsed since an earlier date (saturating).
    #[inline]
    pub fn millis_since(self, earlier: Date) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

enum ClockKind {
    Real { epoch: Instant },
    Virtual { now_ms: AtomicU64 },
}

/// Monotonic clock source; real in production, virtual (manually advanced)
/// under deterministic tests. Cheaply cloneable; clones share the timeline.
#[derive(Clone)]
pub struct Clock(Arc<ClockKind>);

impl Clock {
    /// Creates a real clock anchored at construction time.
    pub fn real() -> Self {
        Clock(Arc::new(ClockKind::Real {
            epoch: Instant::now(),
        }))
    }

    /// Creates a virtual clock starting at the base date.
    pub fn virtual_clock() -> Self {
        Clock(Arc::new(ClockKind::Virtual {
            now_ms: AtomicU64::new(CLOCK_BASE_MS),
        }))
    }

    /// Reads the current date.
    pub fn now(&self) -> Date {
        match &*self.0 {
            ClockKind::Real { epoch } => {
                Date(CLOCK_BASE_MS + epoch.elapsed().as_millis() as u64)
            }
            ClockKind::Virtual { now_ms } => Date(now_ms.load(Ordering::SeqCst)),
        }
    }

    /// True if this is a virtual clock.
    pub fn is_virtual(&self) -> bool {
        matches!(&*self.0, ClockKind::Virtual { .. })
    }

    /// Moves a virtual clock forward to the given date. Dates in the past
    /// are ignored (the clock never moves backward). Errs on a real clock.
    pub fn advance_to(&self, when: Date) -> Result<(), ReplSetError> {
        match &*self.0 {
            ClockKind::Real { .. } => logged_err!(
                ErrorCode::OperationFailed;
                "cannot manually advance a real clock"
            ),
            ClockKind::Virtual { now_ms } => {
                now_ms.fetch_max(when.0, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn zero_date_sentinel() {
        assert!(Date::ZERO.is_zero());
        assert!(!Date(1).is_zero());
        assert!(Date(5).plus_millis(10) > Date(14));
        assert_eq!(Date(30).millis_since(Date(10)), 20);
        assert_eq!(Date(10).millis_since(Date(30)), 0);
    }

    #[test]
    fn virtual_advance() -> Result<(), ReplSetError> {
        let clock = Clock::virtual_clock();
        let start = clock.now();
        assert!(!start.is_zero());
        clock.advance_to(start.plus_millis(250))?;
        assert_eq!(clock.now(), start.plus_millis(250));
        // moving backward is a no-op
        clock.advance_to(start)?;
        assert_eq!(clock.now(), start.plus_millis(250));
        Ok(())
    }

    #[test]
    fn real_advance_rejected() {
        let clock = Clock::real();
        assert!(clock.advance_to(Date(99999)).is_err());
    }
}
