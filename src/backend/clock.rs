use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::{BackendError, BackendResult};

/// Hands out commit timestamps that strictly increase across the whole
/// emulator, even when the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct CommitClock {
    last_micros: AtomicI64,
}

impl CommitClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after the given timestamp (used when restoring a snapshot).
    pub fn starting_after(last_micros: i64) -> Self {
        Self {
            last_micros: AtomicI64::new(last_micros),
        }
    }

    pub fn last_micros(&self) -> i64 {
        self.last_micros.load(Ordering::Acquire)
    }

    /// Next commit timestamp: `max(now, previous + 1µs)`.
    pub fn next_commit(&self) -> BackendResult<DateTime<Utc>> {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last_micros.load(Ordering::Acquire);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return to_timestamp(candidate),
                Err(observed) => prev = observed,
            }
        }
    }

    /// Timestamp for a strong read: sees every commit handed out so far.
    pub fn read_timestamp(&self) -> BackendResult<DateTime<Utc>> {
        let now = Utc::now().timestamp_micros();
        to_timestamp(now.max(self.last_micros()))
    }
}

fn to_timestamp(micros: i64) -> BackendResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| BackendError::Internal(format!("timestamp out of range: {}µs", micros)))
}
