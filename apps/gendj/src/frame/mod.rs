pub mod capture;
pub mod render;
pub mod source;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed canvas the worker pipeline expects on both directions of the stream.
pub const FRAME_WIDTH: u32 = 512;
pub const FRAME_HEIGHT: u32 = 512;
/// Target outbound capture rate in frames per second.
pub const FRAME_RATE: u32 = 30;
/// JPEG quality used for every encoded frame.
pub const JPEG_QUALITY: u8 = 80;

/// Minimum spacing between two captured frames.
pub fn frame_interval() -> Duration {
    Duration::from_secs_f64(1.0 / FRAME_RATE as f64)
}

#[derive(Debug, Error)]
pub enum StrideError {
    #[error("unsupported frame stride '{0}' (expected none or 2-5)")]
    Unsupported(String),
}

/// Outbound frame-drop stride.
///
/// `Every(n)` drops every nth captured frame (indices divisible by `n`),
/// rather than keeping only every nth: a stride of 2 sheds roughly half the
/// frames. Indices 0 and 1 always pass so a fresh stream never stalls before
/// the remote pipeline has seen anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Stride {
    None,
    Every(u8),
}

impl Stride {
    pub fn should_send(self, frame_index: u64) -> bool {
        match self {
            Stride::None => true,
            Stride::Every(n) => frame_index <= 1 || frame_index % u64::from(n) != 0,
        }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Stride::None
    }
}

impl FromStr for Stride {
    type Err = StrideError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "none" => Ok(Stride::None),
            "2" => Ok(Stride::Every(2)),
            "3" => Ok(Stride::Every(3)),
            "4" => Ok(Stride::Every(4)),
            "5" => Ok(Stride::Every(5)),
            other => Err(StrideError::Unsupported(other.to_string())),
        }
    }
}

impl fmt::Display for Stride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stride::None => f.write_str("none"),
            Stride::Every(n) => write!(f, "{n}"),
        }
    }
}

impl TryFrom<String> for Stride {
    type Error = StrideError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Stride> for String {
    fn from(stride: Stride) -> Self {
        stride.to_string()
    }
}

/// Placement of a scaled source image on the fixed outbound canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitPlacement {
    pub width: u32,
    pub height: u32,
    pub x: i64,
    pub y: i64,
}

/// Uniform letterbox fit: scale by `min(dst_w/src_w, dst_h/src_h)` and center.
/// The whole source frame stays visible; the uncovered margin stays black.
pub fn letterbox_fit(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> FitPlacement {
    let scale = f64::min(
        f64::from(dst_w) / f64::from(src_w),
        f64::from(dst_h) / f64::from(src_h),
    );
    let width = ((f64::from(src_w) * scale).round() as u32).clamp(1, dst_w);
    let height = ((f64::from(src_h) * scale).round() as u32).clamp(1, dst_h);
    FitPlacement {
        width,
        height,
        x: i64::from((dst_w - width) / 2),
        y: i64::from((dst_h - height) / 2),
    }
}
