//! card-scanner: live-feed trading card detection and identification
//!
//! Frames flow through boundary detection, perspective rectification and
//! region text extraction into a catalog matcher, with a rate-limited cloud
//! identifier as fallback. A lock state machine ties the stages together so
//! each card held in front of the camera yields at most one result.

pub mod capture;
pub mod catalog;
pub mod config;
pub mod identify;
pub mod pipeline;
pub mod shared;
pub mod storage;
pub mod vision;

pub use capture::{DirectorySource, Frame, FrameSource};
pub use catalog::{Catalog, CatalogEntry, SpeciesList};
pub use config::{ConfigError, ScannerConfig};
pub use identify::{ConfidenceSource, IdentificationResult};
pub use pipeline::ScanPipeline;
pub use shared::{EventSink, ScanEvent, ScannerStatus};
