use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Frozen(DateTime<Utc>),
    System,
}

/// A clock that can be pushed forward on demand.
///
/// Shared between an in-memory backend and the store so both agree on when
/// entries expire. A frozen clock only moves through [`ManualClock::advance`];
/// a system-following clock runs with wall time plus whatever was advanced.
#[derive(Debug)]
pub struct ManualClock {
    origin: Origin,
    offset: Mutex<chrono::Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            origin: Origin::Frozen(start),
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    pub fn system() -> Self {
        ManualClock {
            origin: Origin::System,
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut offset = match self.offset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *offset = offset.checked_add(&by).unwrap_or(chrono::Duration::MAX);
    }

    fn offset(&self) -> chrono::Duration {
        match self.offset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let base = match self.origin {
            Origin::Frozen(start) => start,
            Origin::System => Utc::now(),
        };
        base.checked_add_signed(self.offset())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_clock_moves_only_on_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(61));
    }

    #[test]
    fn test_system_clock_is_ahead_by_advanced_amount() {
        let clock = ManualClock::system();
        clock.advance(Duration::from_secs(3600));
        assert!(clock.now() >= Utc::now() + chrono::Duration::seconds(3599));
    }
}
