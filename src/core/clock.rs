use super::types::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};

/// Pluggable time source for value writes (§4.1, §9 "expose the time
/// source for tests"). `set_*` operations fall back to `SystemClock`
/// when the caller passes no explicit `when`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_chrono(chrono::Utc::now())
    }
}

/// A clock a test can advance deterministically, used to exercise the
/// subsumption and fresh-timestamp rules without sleeping.
#[derive(Debug)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(initial: Timestamp) -> Self {
        FixedClock(AtomicI64::new(initial.ticks()))
    }

    pub fn set(&self, value: Timestamp) {
        self.0.store(value.ticks(), Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.0.fetch_add(seconds * 10_000_000, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_ticks(self.0.load(Ordering::SeqCst))
    }
}
