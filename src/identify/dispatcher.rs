//! Cloud call admission gate
//!
//! At most one cloud call is in flight at any time, and calls are spaced at
//! least one cooldown apart. The in-flight slot outlives the lock that asked
//! for it: only the call's completion frees it.

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CloudDispatcher {
    cooldown: Duration,
    in_flight: bool,
    last_admitted: Option<Instant>,
    admitted_total: u64,
}

impl CloudDispatcher {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            in_flight: false,
            last_admitted: None,
            admitted_total: 0,
        }
    }

    /// Whether a call would be admitted at `now`
    pub fn can_admit(&self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        match self.last_admitted {
            Some(last) => now.saturating_duration_since(last) >= self.cooldown,
            None => true,
        }
    }

    /// Claim the in-flight slot. Returns false when the gate is closed.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        if !self.can_admit(now) {
            return false;
        }
        self.in_flight = true;
        self.last_admitted = Some(now);
        self.admitted_total += 1;
        debug!("Cloud call admitted (#{})", self.admitted_total);
        true
    }

    /// Free the in-flight slot once a call completes, whatever its outcome
    pub fn release(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total
    }
}
