//! Time as a seam: deadline math and staleness checks go through a [`Clock`]
//! instead of calling `Utc::now()` directly, so tests can control time.

use chrono::{DateTime, Utc};

/// A source of "now". The default is [`SystemClock`]; tests can substitute
/// a fixed or steppable clock without touching the modules that consume it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads real wall-clock time via `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    /// A fixed clock that can be advanced explicitly, for deterministic tests.
    pub struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub fn at(t: DateTime<Utc>) -> Self {
            Self(Mutex::new(t))
        }

        pub fn advance(&self, delta: Duration) {
            let mut t = self.0.lock().unwrap();
            *t = *t + delta;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn system_clock_advances() {
        let a = SystemClock.now();
        let b = SystemClock.now();
        assert!(b >= a);
    }

    #[test]
    fn fixed_clock_only_moves_when_advanced() {
        let clock = FixedClock::at(Utc::now());
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::seconds(60));
        assert_eq!(clock.now(), t0 + Duration::seconds(60));
    }
}
