//! Events emitted by the scan pipeline to its consumer

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::identify::IdentificationResult;
use crate::vision::geometry::Quadrilateral;

/// Pipeline output
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A card entered the frame and was locked
    Locked { lock_id: Uuid, quad: Quadrilateral },
    /// The locked card was identified (at most once per lock)
    Identified {
        lock_id: Uuid,
        result: IdentificationResult,
    },
    /// The lock expired without an identification
    Missed { lock_id: Uuid },
    /// Soft warning: a cloud call failed, scanning continues
    CloudDegraded { reason: String, retryable: bool },
}

impl ScanEvent {
    pub fn lock_id(&self) -> Option<Uuid> {
        match self {
            ScanEvent::Locked { lock_id, .. }
            | ScanEvent::Identified { lock_id, .. }
            | ScanEvent::Missed { lock_id } => Some(*lock_id),
            ScanEvent::CloudDegraded { .. } => None,
        }
    }
}

/// Receiver of pipeline events
pub trait EventSink: Send {
    fn emit(&mut self, event: ScanEvent);
}

impl EventSink for Sender<ScanEvent> {
    fn emit(&mut self, event: ScanEvent) {
        // A dropped receiver only means nobody is listening any more
        let _ = self.send(event);
    }
}

impl EventSink for Vec<ScanEvent> {
    fn emit(&mut self, event: ScanEvent) {
        self.push(event);
    }
}
