//! Wall-clock time source shared by every deadline (cache expiry, backoff, cooldown, drain samples).

/// Seconds since the UNIX epoch.
///
/// Deadlines are persisted in the datastore, so they must stay comparable
/// after a restart. A monotonic clock would not survive that.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }
}
