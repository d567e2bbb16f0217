//! Shared status and event types between the scan loop and its host
//!
//! The pipeline pushes events through an [`EventSink`] and keeps a
//! [`ScannerStatus`] snapshot a host application can poll.

pub mod messages;
pub mod state;

pub use messages::{EventSink, ScanEvent};
pub use state::{ScannerStatus, SharedStatus};
