//! Scan pipeline
//!
//! [`lock`] holds the pure lock state machine, [`runner`] the async loop that
//! feeds it frames and carries out its actions.

pub mod lock;
pub mod runner;

pub use lock::{LockAction, LockCycle, LockState, LockStateMachine};
pub use runner::ScanPipeline;
