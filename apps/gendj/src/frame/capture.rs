//! Outbound pipeline: grab a raw frame from the active source, letterbox it
//! onto the fixed canvas, JPEG-encode, run the stride policy and hand the
//! result to the frame outlet. Runs as one owned task; dropping the handle
//! stops the loop, so no tick can fire after teardown.

use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::source::SourceCatalog;
use super::{frame_interval, letterbox_fit, Stride, FRAME_HEIGHT, FRAME_WIDTH, JPEG_QUALITY};
use crate::telemetry;
use crate::transport::frames::FrameOutlet;
use std::sync::Arc;

/// Encode one canvas to the wire format (JPEG, fixed quality).
pub fn encode_jpeg(image: &RgbImage) -> Result<Bytes, image::ImageError> {
    let _guard = telemetry::PerfGuard::new("capture.encode");
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ColorType::Rgb8,
    )?;
    Ok(Bytes::from(buf))
}

/// Scale the source uniformly (letterbox, never crop) and center it on a
/// black canvas at stream geometry.
pub fn compose_letterbox(frame: &RgbImage) -> RgbImage {
    let (src_w, src_h) = frame.dimensions();
    if (src_w, src_h) == (FRAME_WIDTH, FRAME_HEIGHT) {
        return frame.clone();
    }
    let fit = letterbox_fit(src_w, src_h, FRAME_WIDTH, FRAME_HEIGHT);
    let scaled = image::imageops::resize(frame, fit.width, fit.height, FilterType::Triangle);
    let mut canvas = RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT);
    image::imageops::overlay(&mut canvas, &scaled, fit.x, fit.y);
    canvas
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    SwitchDevice(usize),
    SetStride(Stride),
}

pub struct CaptureHandle {
    commands: mpsc::UnboundedSender<CaptureCommand>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn command(&self, command: CaptureCommand) {
        let _ = self.commands.send(command);
    }

    /// Stop the loop and wait for the in-flight tick to finish.
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.task.await;
    }
}

/// Spawn the capture loop over `catalog`, writing encoded frames into
/// `outlet`.
pub fn spawn(mut catalog: SourceCatalog, outlet: Arc<FrameOutlet>, stride: Stride) -> CaptureHandle {
    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut stride = stride;
        // Tick at display-ish cadence; the capture throttle below enforces
        // the target frame rate.
        let mut ticker = tokio::time::interval(frame_interval() / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frame_counter: u64 = 0;
        let mut last_capture: Option<Instant> = None;

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(CaptureCommand::SwitchDevice(index)) => {
                        catalog.switch_to(index);
                        debug!(target: "gendj::capture", index, "capture device switched");
                    }
                    Some(CaptureCommand::SetStride(next)) => {
                        stride = next;
                        debug!(target: "gendj::capture", stride = %stride, "frame stride changed");
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if last_capture
                        .is_some_and(|at| now.duration_since(at) < frame_interval())
                    {
                        continue;
                    }
                    let raw = match catalog.grab() {
                        Ok(raw) => raw,
                        Err(err) => {
                            warn!(target: "gendj::capture", error = %err, "frame grab failed");
                            continue;
                        }
                    };
                    let canvas = compose_letterbox(&raw);
                    match encode_jpeg(&canvas) {
                        Ok(jpeg) => {
                            if stride.should_send(frame_counter) {
                                outlet.send(jpeg);
                            }
                            frame_counter += 1;
                            last_capture = Some(now);
                        }
                        Err(err) => {
                            warn!(target: "gendj::capture", error = %err, "frame encode failed");
                        }
                    }
                }
            }
        }
        debug!(target: "gendj::capture", frames = frame_counter, "capture loop stopped");
    });
    CaptureHandle { commands, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encode_produces_jpeg_magic() {
        let canvas = RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT);
        let jpeg = encode_jpeg(&canvas).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn encoded_frame_decodes_back_to_stream_geometry() {
        let canvas = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([40, 80, 120]));
        let jpeg = encode_jpeg(&canvas).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (FRAME_WIDTH, FRAME_HEIGHT));
    }

    #[test]
    fn letterbox_keeps_margins_black() {
        let wide = RgbImage::from_pixel(1024, 576, Rgb([255, 0, 0]));
        let canvas = compose_letterbox(&wide);
        assert_eq!(canvas.dimensions(), (FRAME_WIDTH, FRAME_HEIGHT));
        // Top margin stays black, the centered band carries the source.
        assert_eq!(canvas.get_pixel(256, 10).0, [0, 0, 0]);
        let center = canvas.get_pixel(256, 256).0;
        assert!(center[0] > 200 && center[1] < 50 && center[2] < 50);
    }

    #[test]
    fn square_source_skips_scaling() {
        let square = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([1, 2, 3]));
        let canvas = compose_letterbox(&square);
        assert_eq!(canvas.as_raw(), square.as_raw());
    }
}
