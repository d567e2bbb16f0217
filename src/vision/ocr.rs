//! OCR (Optical Character Recognition) module
//!
//! The recognition engine is an external collaborator behind the
//! [`TextRecognizer`] trait. A Tesseract command-line adapter is provided.

use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::GrayImage;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Text recognition failure
#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("failed to encode image for recognition: {0}")]
    Encode(#[from] image::ImageError),
    #[error("recognizer process I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("recognizer failed: {0}")]
    Engine(String),
}

/// Single-image text recognizer
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Recognize the text in `image`, restricted to `whitelist`.
    /// An empty string means nothing legible was found.
    async fn recognize(
        &self,
        image: &GrayImage,
        whitelist: &str,
        single_line: bool,
    ) -> Result<String, RecognizeError>;
}

/// Tesseract invoked as a subprocess, reading PNG from stdin
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    language: String,
}

impl TesseractCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            language: "eng".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Check that the binary runs; called once at startup
    pub async fn probe(&self) -> Result<String, RecognizeError> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        info!("Using text recognizer {:?}: {}", self.binary, version);
        Ok(version)
    }

    fn page_segmentation_mode(single_line: bool) -> &'static str {
        // 7 = single text line, 6 = single uniform block
        if single_line {
            "7"
        } else {
            "6"
        }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl TextRecognizer for TesseractCli {
    async fn recognize(
        &self,
        image: &GrayImage,
        whitelist: &str,
        single_line: bool,
    ) -> Result<String, RecognizeError> {
        let mut png = Vec::new();
        image.write_with_encoder(PngEncoder::new(&mut png))?;

        let mut child = Command::new(&self.binary)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--psm")
            .arg(Self::page_segmentation_mode(single_line))
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", whitelist))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RecognizeError::Engine(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("Recognized {} bytes of text", text.len());
        Ok(text)
    }
}
