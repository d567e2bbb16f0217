//! Scanner Configuration
//!
//! Every tunable of the pipeline, stored in TOML format. Values are passed
//! explicitly to each component; nothing here is global.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, rejected when the pipeline is constructed
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("aspect band [{min}, {max}] must satisfy 0 < min < max <= 1")]
    InvalidAspectBand { min: f32, max: f32 },
    #[error("minimum area fraction {0} must be in (0, 1)")]
    InvalidAreaFraction(f32),
    #[error("canonical card dimensions {width}x{height} must be positive")]
    InvalidCanonicalSize { width: u32, height: u32 },
    #[error("region '{0}' must lie within [0, 1] with positive extent")]
    InvalidRegion(&'static str),
    #[error("upscale factor must be at least 1")]
    InvalidUpscale,
    #[error("character whitelist for '{0}' is empty")]
    EmptyWhitelist(&'static str),
    #[error("{0} must be greater than zero")]
    NonPositiveDuration(&'static str),
    #[error("detection max dimension must be at least 16 pixels")]
    InvalidMaxDimension,
    #[error("edge margin {0} must not be negative")]
    InvalidEdgeMargin(f32),
}

/// Complete scanner settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Boundary detection settings
    pub detection: DetectionConfig,
    /// Canonical card settings
    pub canonical: CanonicalConfig,
    /// Text region settings
    pub regions: RegionConfig,
    /// Catalog matcher settings
    pub matcher: MatcherSettings,
    /// Lock state machine settings
    pub lock: LockConfig,
    /// Cloud fallback settings
    pub cloud: CloudConfig,
}

impl ScannerConfig {
    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection;
        if !(d.aspect_min > 0.0 && d.aspect_min < d.aspect_max && d.aspect_max <= 1.0) {
            return Err(ConfigError::InvalidAspectBand {
                min: d.aspect_min,
                max: d.aspect_max,
            });
        }
        if !(d.min_area_fraction > 0.0 && d.min_area_fraction < 1.0) {
            return Err(ConfigError::InvalidAreaFraction(d.min_area_fraction));
        }
        if d.max_dimension < 16 {
            return Err(ConfigError::InvalidMaxDimension);
        }
        if d.edge_margin.is_nan() || d.edge_margin < 0.0 {
            return Err(ConfigError::InvalidEdgeMargin(d.edge_margin));
        }

        let c = &self.canonical;
        if c.width == 0 || c.height == 0 {
            return Err(ConfigError::InvalidCanonicalSize {
                width: c.width,
                height: c.height,
            });
        }

        let r = &self.regions;
        if !r.name_band.is_valid() {
            return Err(ConfigError::InvalidRegion("name_band"));
        }
        if !r.number_band.is_valid() {
            return Err(ConfigError::InvalidRegion("number_band"));
        }
        if r.upscale < 1 {
            return Err(ConfigError::InvalidUpscale);
        }
        if r.name_whitelist.is_empty() {
            return Err(ConfigError::EmptyWhitelist("name_band"));
        }
        if r.number_whitelist.is_empty() {
            return Err(ConfigError::EmptyWhitelist("number_band"));
        }

        if self.lock.timeout_ms == 0 {
            return Err(ConfigError::NonPositiveDuration("lock timeout"));
        }
        if self.lock.tick_interval_ms == 0 {
            return Err(ConfigError::NonPositiveDuration("tick interval"));
        }
        if self.cloud.cooldown_ms == 0 {
            return Err(ConfigError::NonPositiveDuration("cloud cooldown"));
        }
        if self.cloud.request_timeout_ms == 0 {
            return Err(ConfigError::NonPositiveDuration("cloud request timeout"));
        }

        Ok(())
    }
}

/// Boundary detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Longest side of the downsampled working image
    pub max_dimension: u32,
    /// Minimum contour area as a fraction of the working image area
    pub min_area_fraction: f32,
    /// Lower bound of short-edge / long-edge ratio
    pub aspect_min: f32,
    /// Upper bound of short-edge / long-edge ratio
    pub aspect_max: f32,
    /// Gaussian blur sigma applied after equalization
    pub blur_sigma: f32,
    /// Radius of the local-mean window for adaptive thresholding
    pub threshold_block_radius: u32,
    /// Minimum deviation from the local mean to mark a pixel
    pub threshold_offset: u8,
    /// Canny hysteresis thresholds
    pub canny_low: f32,
    pub canny_high: f32,
    /// Quads with a corner closer than this many working-image pixels to
    /// the border are treated as partially out of frame and rejected. Set to
    /// 0 to accept cards that fill the whole frame.
    pub edge_margin: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_dimension: 320,
            min_area_fraction: 0.12,
            aspect_min: 0.55,
            aspect_max: 0.90,
            blur_sigma: 1.5,
            threshold_block_radius: 7,
            threshold_offset: 12,
            canny_low: 20.0,
            canny_high: 60.0,
            edge_margin: 1.0,
        }
    }
}

/// Canonical (rectified) card settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalConfig {
    pub width: u32,
    pub height: u32,
    /// RGB color used for samples that fall outside the frame
    pub padding: [u8; 3],
    /// JPEG quality used when sending the card to the cloud
    pub jpeg_quality: u8,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 560,
            padding: [0, 0, 0],
            jpeg_quality: 85,
        }
    }
}

/// Rectangle expressed as fractions of the canonical card
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionalRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl FractionalRect {
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    fn is_valid(&self) -> bool {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        in_unit(self.x0) && in_unit(self.x1) && in_unit(self.y0) && in_unit(self.y1)
            && self.x0 < self.x1
            && self.y0 < self.y1
    }

    /// Pixel bounds (x, y, width, height) inside an image of the given size.
    /// Always at least one pixel wide and tall.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x = ((self.x0 * width as f32).floor() as u32).min(width.saturating_sub(1));
        let y = ((self.y0 * height as f32).floor() as u32).min(height.saturating_sub(1));
        let x_end = ((self.x1 * width as f32).ceil() as u32).clamp(x + 1, width.max(x + 1));
        let y_end = ((self.y1 * height as f32).ceil() as u32).clamp(y + 1, height.max(y + 1));
        (x, y, x_end - x, y_end - y)
    }
}

/// Text region extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Card name band (top-left)
    pub name_band: FractionalRect,
    /// Collector number band (bottom-left)
    pub number_band: FractionalRect,
    /// Integer upscale applied to each crop before recognition
    pub upscale: u32,
    /// Binarization threshold on luminance (0-255)
    pub binarize_threshold: u8,
    /// Characters the recognizer may emit for the name band
    pub name_whitelist: String,
    /// Characters the recognizer may emit for the number band
    pub number_whitelist: String,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            name_band: FractionalRect::new(0.05, 0.02, 0.75, 0.11),
            number_band: FractionalRect::new(0.02, 0.88, 0.42, 0.98),
            upscale: 3,
            binarize_threshold: 130,
            name_whitelist: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz -".to_string(),
            number_whitelist: "0123456789/ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz"
                .to_string(),
        }
    }
}

/// Catalog matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherSettings {
    /// Confidence floor for accepting a local match
    pub min_score: u32,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self { min_score: 4 }
    }
}

/// Lock state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Time after locking before an unresolved lock is abandoned
    pub timeout_ms: u64,
    /// Interval between pipeline ticks
    pub tick_interval_ms: u64,
    /// Keep detecting against the frame that triggered the lock
    pub freeze_on_lock: bool,
    /// Only call the cloud after local matching came back inconclusive
    pub local_first: bool,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            tick_interval_ms: 150,
            freeze_on_lock: true,
            local_first: true,
        }
    }
}

/// Cloud fallback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Minimum time between two admitted cloud calls
    pub cooldown_ms: u64,
    /// Identification service endpoint (cloud fallback disabled when unset)
    pub endpoint: Option<String>,
    /// Environment variable holding the service API key
    pub api_key_env: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Instruction sent along with the card image
    pub instruction: String,
}

impl CloudConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 3_000,
            endpoint: None,
            api_key_env: "CARD_SCANNER_API_KEY".to_string(),
            request_timeout_ms: 15_000,
            instruction: "Identify this trading card. Respond with JSON containing name, set, \
                          number, rarity, type, hp, marketValue and sourceUrl. Use null for \
                          anything you cannot read."
                .to_string(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<ScannerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: ScannerConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &ScannerConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
