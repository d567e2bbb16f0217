//! Scanner status shared with a host application

use parking_lot::RwLock;
use std::sync::Arc;

use crate::identify::ConfidenceSource;
use crate::shared::messages::ScanEvent;
use crate::vision::geometry::Quadrilateral;

/// Thread-safe handle to the live status
pub type SharedStatus = Arc<RwLock<ScannerStatus>>;

/// Snapshot of what the scanner is doing, updated every tick
#[derive(Debug, Clone, Default)]
pub struct ScannerStatus {
    /// Lock phase name ("searching", "locked", "resolving")
    pub phase: &'static str,
    /// Boundary from the latest detection, if any
    pub current_quad: Option<Quadrilateral>,
    pub ticks: u64,
    pub locks: u64,
    pub local_hits: u64,
    pub cloud_hits: u64,
    pub misses: u64,
    pub cloud_calls: u64,
    /// Name of the most recent identification
    pub last_identified: Option<String>,
    /// Last soft warning (if any)
    pub last_warning: Option<String>,
}

impl ScannerStatus {
    pub fn new() -> Self {
        Self {
            phase: "searching",
            ..Default::default()
        }
    }

    pub fn shared() -> SharedStatus {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Fold one event into the counters
    pub fn record(&mut self, event: &ScanEvent) {
        match event {
            ScanEvent::Locked { .. } => self.locks += 1,
            ScanEvent::Identified { result, .. } => {
                match result.source {
                    ConfidenceSource::Local => self.local_hits += 1,
                    ConfidenceSource::Cloud => {
                        // The cloud answered again
                        self.cloud_hits += 1;
                        self.clear_warning();
                    }
                }
                self.last_identified = Some(result.name.clone());
            }
            ScanEvent::Missed { .. } => self.misses += 1,
            ScanEvent::CloudDegraded { reason, .. } => self.set_warning(reason.as_str()),
        }
    }

    /// Set a warning message
    pub fn set_warning(&mut self, warning: impl Into<String>) {
        self.last_warning = Some(warning.into());
    }

    /// Clear any warning state
    pub fn clear_warning(&mut self) {
        self.last_warning = None;
    }

    /// Fraction of locks that ended in an identification
    pub fn hit_rate(&self) -> f32 {
        if self.locks == 0 {
            return 0.0;
        }
        (self.local_hits + self.cloud_hits) as f32 / self.locks as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::{CloudCard, IdentificationResult};
    use uuid::Uuid;

    #[test]
    fn test_record_events() {
        let catalog = crate::catalog::Catalog::sample().unwrap();
        let mut status = ScannerStatus::new();
        assert_eq!(status.phase, "searching");

        let id = Uuid::new_v4();
        status.record(&ScanEvent::Locked {
            lock_id: id,
            quad: Quadrilateral::default(),
        });
        status.record(&ScanEvent::Identified {
            lock_id: id,
            result: IdentificationResult::from_entry(&catalog.entries()[0]),
        });
        status.record(&ScanEvent::Locked {
            lock_id: Uuid::new_v4(),
            quad: Quadrilateral::default(),
        });
        status.record(&ScanEvent::Missed { lock_id: id });

        assert_eq!(status.locks, 2);
        assert_eq!(status.local_hits, 1);
        assert_eq!(status.misses, 1);
        assert_eq!(status.last_identified.as_deref(), Some(catalog.entries()[0].name.as_str()));
        assert!((status.hit_rate() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_warning() {
        let mut status = ScannerStatus::new();
        status.record(&ScanEvent::CloudDegraded {
            reason: "rate limited".to_string(),
            retryable: true,
        });
        assert_eq!(status.last_warning.as_deref(), Some("rate limited"));

        let card = CloudCard {
            name: Some("Latias ex".to_string()),
            ..Default::default()
        };
        status.record(&ScanEvent::Identified {
            lock_id: Uuid::new_v4(),
            result: IdentificationResult::from_cloud(&card).unwrap(),
        });
        assert!(status.last_warning.is_none());
        assert_eq!(status.cloud_hits, 1);
    }
}
