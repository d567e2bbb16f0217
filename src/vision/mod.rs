//! Vision layer
//!
//! Everything that touches pixels: boundary detection, perspective
//! rectification, text band preprocessing and region text extraction.
//! The text recognition engine itself sits behind [`TextRecognizer`].

pub mod detection;
pub mod extract;
pub mod geometry;
pub mod ocr;
pub mod ocr_preprocess;
pub mod rectify;

pub use detection::BoundaryDetector;
pub use extract::{ExtractedText, RegionTextExtractor};
pub use geometry::{Point, Quadrilateral};
pub use ocr::{RecognizeError, TesseractCli, TextRecognizer};
pub use rectify::{CanonicalCard, RectifyError, Rectifier};
