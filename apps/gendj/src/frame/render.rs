//! Inbound pacing: processed frames arrive with network jitter, the
//! scheduler paints them at the measured arrival rate instead. Strict FIFO;
//! a deep queue forces catch-up paints and a 1s staleness floor keeps the
//! picture moving even when arrivals nearly stop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbImage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::telemetry;

/// Queue depth beyond which the elapsed-time gate is bypassed so the
/// scheduler can catch up.
const CATCH_UP_DEPTH: usize = 8;
/// A frame is painted at least this often while any are queued.
const STALENESS_FLOOR: Duration = Duration::from_secs(1);
/// Arrival timestamps older than this fall out of the measured rate.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// One decoded frame back from the worker.
pub struct InboundFrame {
    pub image: RgbImage,
    pub received_at: Instant,
}

/// Destination of painted frames.
pub trait RenderSink: Send {
    fn paint(&mut self, frame: &InboundFrame);
}

/// Writes every painted frame to one PNG path, latest wins. The headless
/// equivalent of the processed-output canvas.
pub struct PreviewWriter {
    path: PathBuf,
}

impl PreviewWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RenderSink for PreviewWriter {
    fn paint(&mut self, frame: &InboundFrame) {
        if let Err(err) = frame.image.save_with_format(&self.path, ImageFormat::Png) {
            warn!(target: "gendj::render", path = %self.path.display(), error = %err, "preview write failed");
        }
    }
}

/// Discards paints; used when no preview target is configured.
pub struct NullSink;

impl RenderSink for NullSink {
    fn paint(&mut self, _frame: &InboundFrame) {}
}

pub struct RenderScheduler {
    queue: VecDeque<InboundFrame>,
    arrivals: VecDeque<Instant>,
    last_paint: Option<Instant>,
    target_rate: u32,
}

impl RenderScheduler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            arrivals: VecDeque::new(),
            last_paint: None,
            target_rate,
        }
    }

    pub fn enqueue(&mut self, frame: InboundFrame) {
        self.arrivals.push_back(frame.received_at);
        self.queue.push_back(frame);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Arrivals inside the trailing window, i.e. the measured inbound fps.
    pub fn measured_fps(&mut self, now: Instant) -> usize {
        let cutoff = now.checked_sub(RATE_WINDOW);
        if let Some(cutoff) = cutoff {
            while self.arrivals.front().is_some_and(|&at| at < cutoff) {
                self.arrivals.pop_front();
            }
        }
        self.arrivals.len()
    }

    /// One display tick: paint at most one frame (the oldest queued), gated
    /// on the measured arrival interval, the catch-up depth and the
    /// staleness floor. Returns whether a frame was painted.
    pub fn tick(&mut self, now: Instant, sink: &mut dyn RenderSink) -> bool {
        let measured = self.measured_fps(now);
        telemetry::record_gauge("render.measured_fps", measured as u64);
        telemetry::record_gauge("render.queue_depth", self.queue.len() as u64);

        let paint_interval = if measured > 0 {
            Duration::from_secs_f64(1.0 / measured as f64)
        } else {
            Duration::from_secs_f64(1.0 / self.target_rate as f64)
        };
        let due = match self.last_paint {
            None => true,
            Some(at) => {
                let elapsed = now.duration_since(at);
                elapsed >= paint_interval
                    || self.queue.len() > CATCH_UP_DEPTH
                    || elapsed >= STALENESS_FLOOR
            }
        };
        if !due {
            return false;
        }
        match self.queue.pop_front() {
            Some(frame) => {
                sink.paint(&frame);
                self.last_paint = Some(now);
                true
            }
            None => false,
        }
    }
}

pub struct RenderHandle {
    task: JoinHandle<()>,
}

impl RenderHandle {
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Drive the scheduler from an inbound frame channel at display cadence.
/// The loop ends when the channel closes (transport torn down).
pub fn spawn(
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    mut sink: Box<dyn RenderSink>,
    target_rate: u32,
) -> RenderHandle {
    let task = tokio::spawn(async move {
        let mut scheduler = RenderScheduler::new(target_rate);
        let mut ticker = tokio::time::interval(Duration::from_millis(16));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => scheduler.enqueue(frame),
                    None => break,
                },
                _ = ticker.tick() => {
                    scheduler.tick(Instant::now(), sink.as_mut());
                }
            }
        }
        debug!(target: "gendj::render", "render loop stopped");
    });
    RenderHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct CountingSink {
        painted: Vec<u8>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                painted: Vec::new(),
            }
        }
    }

    impl RenderSink for CountingSink {
        fn paint(&mut self, frame: &InboundFrame) {
            // First channel of the first pixel identifies the frame.
            self.painted.push(frame.image.get_pixel(0, 0).0[0]);
        }
    }

    fn frame(tag: u8, received_at: Instant) -> InboundFrame {
        InboundFrame {
            image: RgbImage::from_pixel(2, 2, Rgb([tag, 0, 0])),
            received_at,
        }
    }

    #[test]
    fn one_tick_paints_exactly_the_oldest_frame() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        let now = Instant::now();
        for tag in 0..10u8 {
            scheduler.enqueue(frame(tag, now));
        }

        assert!(scheduler.tick(now, &mut sink));
        assert_eq!(sink.painted, vec![0]);
        assert_eq!(scheduler.queue_depth(), 9);
    }

    #[test]
    fn paints_in_strict_fifo_order() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        let base = Instant::now();
        for tag in 0..5u8 {
            scheduler.enqueue(frame(tag, base));
        }
        let mut at = base;
        for _ in 0..5 {
            at += Duration::from_millis(300);
            scheduler.tick(at, &mut sink);
        }
        assert_eq!(sink.painted, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn elapsed_gate_blocks_back_to_back_paints() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        let now = Instant::now();
        scheduler.enqueue(frame(0, now));
        scheduler.enqueue(frame(1, now));

        assert!(scheduler.tick(now, &mut sink));
        // 2 arrivals in the window -> paint interval 500ms; 1ms later is too
        // soon and the queue is shallow.
        assert!(!scheduler.tick(now + Duration::from_millis(1), &mut sink));
        assert_eq!(sink.painted, vec![0]);
    }

    #[test]
    fn deep_queue_bypasses_the_elapsed_gate() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        let now = Instant::now();
        for tag in 0..10u8 {
            scheduler.enqueue(frame(tag, now));
        }
        assert!(scheduler.tick(now, &mut sink));
        // Depth is 9 (> 8): the next tick paints immediately despite the
        // arrival-rate gate, still in FIFO order.
        assert!(scheduler.tick(now + Duration::from_millis(1), &mut sink));
        assert_eq!(sink.painted, vec![0, 1]);
    }

    #[test]
    fn staleness_floor_paints_after_a_second() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        let base = Instant::now();
        scheduler.enqueue(frame(0, base));
        assert!(scheduler.tick(base, &mut sink));

        // Near-dead inbound rate: a second after the last paint the floor
        // guarantees the queued frame still goes out.
        scheduler.enqueue(frame(1, base + Duration::from_millis(900)));
        assert!(scheduler.tick(base + Duration::from_secs(1), &mut sink));
        assert_eq!(sink.painted, vec![0, 1]);
    }

    #[test]
    fn empty_queue_never_paints() {
        let mut scheduler = RenderScheduler::new(30);
        let mut sink = CountingSink::new();
        assert!(!scheduler.tick(Instant::now(), &mut sink));
        assert!(sink.painted.is_empty());
    }

    #[test]
    fn measured_rate_forgets_old_arrivals() {
        let mut scheduler = RenderScheduler::new(30);
        let base = Instant::now();
        for offset in [0u64, 100, 200] {
            scheduler.enqueue(frame(0, base + Duration::from_millis(offset)));
        }
        assert_eq!(scheduler.measured_fps(base + Duration::from_millis(250)), 3);
        // 1.1s later the first two arrivals have aged out.
        assert_eq!(scheduler.measured_fps(base + Duration::from_millis(1150)), 1);
    }
}
