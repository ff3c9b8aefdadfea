use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use thiserror::Error;
use tracing::warn;

use super::{FRAME_HEIGHT, FRAME_WIDTH};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error reading capture source: {0}")]
    Io(#[from] std::io::Error),
    #[error("no usable frames in {0}")]
    Empty(PathBuf),
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub label: String,
}

/// A raw-frame producer: a live capture device, or a file-backed surrogate
/// standing in for one. Grabbing may fail transiently (device hiccup,
/// unreadable file); the capture loop logs and keeps going.
pub trait FrameSource: Send {
    fn descriptor(&self) -> &SourceDescriptor;
    fn grab(&mut self) -> Result<RgbImage, SourceError>;
}

/// File-backed video surrogate: a directory of still images replayed as an
/// endless loop. Entries that fail to decode are skipped.
pub struct FileSource {
    descriptor: SourceDescriptor,
    entries: Vec<PathBuf>,
    cursor: usize,
}

impl FileSource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("png" | "jpg" | "jpeg")
                )
            })
            .collect();
        entries.sort();
        if entries.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }
        Ok(Self {
            descriptor: SourceDescriptor {
                id: format!("file:{}", dir.display()),
                label: format!("Frames from {}", dir.display()),
            },
            entries,
            cursor: 0,
        })
    }
}

impl FrameSource for FileSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn grab(&mut self) -> Result<RgbImage, SourceError> {
        // One full pass at most; a directory of all-corrupt files is an error.
        for _ in 0..self.entries.len() {
            let path = self.entries[self.cursor].clone();
            self.cursor = (self.cursor + 1) % self.entries.len();
            match image::open(&path) {
                Ok(decoded) => return Ok(decoded.to_rgb8()),
                Err(source) => {
                    warn!(target: "gendj::source", path = %path.display(), error = %source, "skipping undecodable frame");
                }
            }
        }
        Err(SourceError::Empty(PathBuf::from(
            self.descriptor.id.trim_start_matches("file:"),
        )))
    }
}

/// Generated test pattern used when no capture device or frame directory is
/// available: a gradient field with a sweeping bar so motion is visible on
/// the far end.
pub struct SyntheticSource {
    descriptor: SourceDescriptor,
    tick: u32,
    seed: u8,
}

impl SyntheticSource {
    pub fn new(label: &str) -> Self {
        Self {
            descriptor: SourceDescriptor {
                id: format!("synthetic:{label}"),
                label: label.to_string(),
            },
            tick: 0,
            seed: rand::random(),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn grab(&mut self) -> Result<RgbImage, SourceError> {
        let bar = self.tick % FRAME_WIDTH;
        let seed = self.seed;
        let image = RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
            if x.abs_diff(bar) < 8 {
                Rgb([255, 255, 255])
            } else {
                Rgb([(x % 256) as u8, (y % 256) as u8, seed])
            }
        });
        self.tick = self.tick.wrapping_add(4);
        Ok(image)
    }
}

/// A blank (black) canvas at stream geometry; also the payload of warm-up
/// priming frames.
pub fn blank_frame() -> RgbImage {
    RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT)
}

/// The enumerated capture devices for one session, with an active cursor.
/// Switching wraps around, matching the previous/next camera controls.
pub struct SourceCatalog {
    sources: Vec<Box<dyn FrameSource>>,
    active: usize,
}

impl SourceCatalog {
    pub fn new(sources: Vec<Box<dyn FrameSource>>) -> Self {
        Self { sources, active: 0 }
    }

    pub fn device_count(&self) -> usize {
        self.sources.len()
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active_descriptor(&self) -> Option<&SourceDescriptor> {
        self.sources.get(self.active).map(|s| s.descriptor())
    }

    pub fn switch_to(&mut self, index: usize) {
        if index < self.sources.len() {
            self.active = index;
        }
    }

    pub fn grab(&mut self) -> Result<RgbImage, SourceError> {
        let source = self
            .sources
            .get_mut(self.active)
            .expect("catalog must hold at least one source");
        source.grab()
    }
}
