//! Lock state machine
//!
//! Pure and synchronous: it is driven by detector ticks and job completions
//! and answers with the actions the runner has to carry out. Time is always
//! passed in, so every transition can be tested without a clock.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogEntry;
use crate::config::LockConfig;
use crate::identify::{CloudCard, CloudDispatcher, CloudError, IdentificationResult};
use crate::vision::geometry::Quadrilateral;

/// One lock, from the first detection until it resolves or times out
#[derive(Debug, Clone, PartialEq)]
pub struct LockCycle {
    pub id: Uuid,
    /// Latest detected boundary
    pub quad: Quadrilateral,
    pub locked_at: Instant,
    /// Cloud calls admitted for this lock
    pub attempts: u32,
    /// Set after a failure that retrying cannot fix
    pub cloud_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Searching,
    /// Local attempt in progress
    Locked(LockCycle),
    /// Local attempt was inconclusive; waiting on the cloud
    Resolving(LockCycle),
}

impl LockState {
    pub fn cycle(&self) -> Option<&LockCycle> {
        match self {
            LockState::Searching => None,
            LockState::Locked(cycle) | LockState::Resolving(cycle) => Some(cycle),
        }
    }

    fn cycle_mut(&mut self) -> Option<&mut LockCycle> {
        match self {
            LockState::Searching => None,
            LockState::Locked(cycle) | LockState::Resolving(cycle) => Some(cycle),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LockState::Searching => "searching",
            LockState::Locked(_) => "locked",
            LockState::Resolving(_) => "resolving",
        }
    }
}

/// Work and notifications requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LockAction {
    /// A card was just locked
    Locked { lock_id: Uuid, quad: Quadrilateral },
    /// Rectify, extract and match against the catalog
    StartLocal { lock_id: Uuid, quad: Quadrilateral },
    /// Send the canonical card to the cloud; the gate slot is already taken
    StartCloud { lock_id: Uuid },
    Identified {
        lock_id: Uuid,
        result: IdentificationResult,
    },
    /// The lock timed out without an identification
    Missed { lock_id: Uuid },
    /// A cloud call failed; the lock stays alive
    CloudDegraded { reason: String, retryable: bool },
}

pub struct LockStateMachine {
    state: LockState,
    timeout: Duration,
    local_first: bool,
    cloud_enabled: bool,
    /// No new cloud calls are admitted while set
    cloud_paused: bool,
    dispatcher: CloudDispatcher,
}

impl LockStateMachine {
    pub fn new(config: &LockConfig, cloud_cooldown: Duration, cloud_enabled: bool) -> Self {
        Self {
            state: LockState::Searching,
            timeout: config.timeout(),
            local_first: config.local_first,
            cloud_enabled,
            cloud_paused: false,
            dispatcher: CloudDispatcher::new(cloud_cooldown),
        }
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    pub fn current_lock(&self) -> Option<Uuid> {
        self.state.cycle().map(|c| c.id)
    }

    pub fn dispatcher(&self) -> &CloudDispatcher {
        &self.dispatcher
    }

    /// Stop or resume admitting cloud calls. Calls already in flight still
    /// complete normally.
    pub fn pause_cloud(&mut self, paused: bool) {
        self.cloud_paused = paused;
    }

    /// Advance on one detector result
    pub fn tick(&mut self, detection: Option<Quadrilateral>, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();

        if let Some(cycle) = self.state.cycle() {
            if now.saturating_duration_since(cycle.locked_at) >= self.timeout {
                info!(
                    "Lock {} timed out after {} cloud attempt(s)",
                    cycle.id, cycle.attempts
                );
                actions.push(LockAction::Missed { lock_id: cycle.id });
                self.state = LockState::Searching;
                return actions;
            }
        }

        match &mut self.state {
            LockState::Searching => {
                let Some(quad) = detection else {
                    return actions;
                };
                let cycle = LockCycle {
                    id: Uuid::new_v4(),
                    quad,
                    locked_at: now,
                    attempts: 0,
                    cloud_exhausted: false,
                };
                info!("Locked card {}", cycle.id);
                actions.push(LockAction::Locked {
                    lock_id: cycle.id,
                    quad,
                });
                actions.push(LockAction::StartLocal {
                    lock_id: cycle.id,
                    quad,
                });
                self.state = LockState::Locked(cycle);
            }
            LockState::Locked(cycle) | LockState::Resolving(cycle) => {
                // A lost detection never unlocks
                if let Some(quad) = detection {
                    cycle.quad = quad;
                }
            }
        }

        self.maybe_start_cloud(now, &mut actions);
        actions
    }

    /// Outcome of the local attempt for `lock_id`
    pub fn on_local_result(&mut self, lock_id: Uuid, entry: Option<&CatalogEntry>, now: Instant) -> Vec<LockAction> {
        let mut actions = Vec::new();
        if self.current_lock() != Some(lock_id) {
            debug!("Ignoring local result for stale lock {}", lock_id);
            return actions;
        }

        match entry {
            Some(entry) => {
                info!("Identified {} {} locally", entry.name, entry.number);
                actions.push(LockAction::Identified {
                    lock_id,
                    result: IdentificationResult::from_entry(entry),
                });
                self.state = LockState::Searching;
            }
            None => {
                if let LockState::Locked(cycle) = &self.state {
                    debug!("Local attempt for {} inconclusive", lock_id);
                    self.state = LockState::Resolving(cycle.clone());
                }
                self.maybe_start_cloud(now, &mut actions);
            }
        }
        actions
    }

    /// Outcome of a cloud call. Always frees the gate, even for stale locks.
    pub fn on_cloud_result(
        &mut self,
        lock_id: Uuid,
        outcome: Result<CloudCard, CloudError>,
        now: Instant,
    ) -> Vec<LockAction> {
        self.dispatcher.release();

        let mut actions = Vec::new();
        if self.current_lock() != Some(lock_id) {
            debug!("Ignoring cloud result for stale lock {}", lock_id);
            return actions;
        }

        match outcome.and_then(|card| IdentificationResult::from_cloud(&card)) {
            Ok(result) => {
                info!("Identified {} {} via cloud", result.name, result.number);
                actions.push(LockAction::Identified { lock_id, result });
                self.state = LockState::Searching;
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!("Cloud identification failed for {}: {}", lock_id, e);
                if !retryable {
                    if let Some(cycle) = self.state.cycle_mut() {
                        cycle.cloud_exhausted = true;
                    }
                }
                actions.push(LockAction::CloudDegraded {
                    reason: e.to_string(),
                    retryable,
                });
                self.maybe_start_cloud(now, &mut actions);
            }
        }
        actions
    }

    fn wants_cloud(&self) -> bool {
        if !self.cloud_enabled || self.cloud_paused {
            return false;
        }
        match &self.state {
            LockState::Searching => false,
            LockState::Locked(cycle) => !self.local_first && !cycle.cloud_exhausted,
            LockState::Resolving(cycle) => !cycle.cloud_exhausted,
        }
    }

    fn maybe_start_cloud(&mut self, now: Instant, actions: &mut Vec<LockAction>) {
        if !self.wants_cloud() || !self.dispatcher.try_admit(now) {
            return;
        }
        if let Some(cycle) = self.state.cycle_mut() {
            cycle.attempts += 1;
            debug!("Cloud attempt {} for {}", cycle.attempts, cycle.id);
            actions.push(LockAction::StartCloud { lock_id: cycle.id });
        }
    }
}
