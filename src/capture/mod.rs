//! Frame Acquisition Layer
//!
//! The pipeline pulls frames from a [`FrameSource`]. Camera access lives in
//! the host application; a directory-of-stills source is provided for offline
//! runs and the command-line tool.

pub mod frame;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use frame::Frame;

/// Pull-based supplier of frames
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Replays the still images of a directory in file-name order.
///
/// Every image is held for `repeat` ticks so the lock state machine sees the
/// same card across several consecutive frames, as it would with a camera.
pub struct DirectorySource {
    paths: Vec<PathBuf>,
    repeat: usize,
    cursor: usize,
    current: Option<Frame>,
}

impl DirectorySource {
    /// Scan a directory for png/jpg/jpeg/bmp/webp files
    pub fn open(dir: &Path, repeat: usize) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        matches!(
                            ext.to_ascii_lowercase().as_str(),
                            "png" | "jpg" | "jpeg" | "bmp" | "webp"
                        )
                    })
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        debug!("Frame directory {:?} holds {} images", dir, paths.len());

        Ok(Self {
            paths,
            repeat: repeat.max(1),
            cursor: 0,
            current: None,
        })
    }

    /// Number of images found
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let total = self.paths.len() * self.repeat;
            if self.cursor >= total {
                return None;
            }

            let index = self.cursor / self.repeat;
            let first_of_image = self.cursor % self.repeat == 0;
            self.cursor += 1;

            if first_of_image {
                let path = &self.paths[index];
                match image::open(path) {
                    Ok(img) => self.current = Some(Frame::from_dynamic(img)),
                    Err(e) => {
                        warn!("Skipping unreadable frame {:?}: {}", path, e);
                        self.current = None;
                        // Skip the remaining repeats of this image
                        self.cursor = (index + 1) * self.repeat;
                        continue;
                    }
                }
            }

            if let Some(frame) = &self.current {
                return Some(Frame::new(frame.image.clone()));
            }
        }
    }
}
