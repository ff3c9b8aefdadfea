//! Binary frame channel to the worker plus the supervisor that owns its
//! connection policy: warm-up before the first dial to a cold-started
//! worker, blank-frame priming, reconnect with backoff while the session is
//! running, and silent teardown once it is not.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{TransportError, WorkerEndpoints};
use crate::config::Cadence;
use crate::frame::capture::encode_jpeg;
use crate::frame::render::InboundFrame;
use crate::frame::source::blank_frame;
use crate::notice::{NoticeCenter, TransientKind};
use crate::session::lifecycle::LifecycleState;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed,
}

/// One live binary WebSocket to a worker. Outbound messages are JPEG frames;
/// each inbound binary message decodes to exactly one processed frame, pushed
/// onto the render queue in arrival order.
pub struct FrameChannel {
    outbound: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FrameChannel {
    pub async fn connect(
        ws_url: &str,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut sink, mut stream) = ws_stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

        let writer_open = open.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = open.clone();
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Binary(data)) => match image::load_from_memory(&data) {
                        Ok(decoded) => {
                            let frame = InboundFrame {
                                image: decoded.to_rgb8(),
                                received_at: Instant::now(),
                            };
                            if inbound.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(target: "gendj::transport", error = %err, "dropping undecodable inbound frame");
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = reader_events.send(ChannelEvent::Closed);
        });

        let _ = events.send(ChannelEvent::Opened);
        Ok(Self {
            outbound,
            open,
            reader,
            writer,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Opportunistic send: a closed channel drops the frame, no retry buffer.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        telemetry::record_bytes("transport.outbound", frame.len());
        self.outbound.send(frame).is_ok()
    }

    pub(crate) fn attachment(&self) -> Attachment {
        Attachment {
            sender: self.outbound.clone(),
            open: self.open.clone(),
        }
    }

    /// Intentional shutdown: detach the event handling first (so the close
    /// cannot look like a failure and re-trigger reconnection), then drop the
    /// socket.
    pub async fn close(mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        let _ = (&mut self.reader).await;
        let _ = (&mut self.writer).await;
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Clone)]
pub(crate) struct Attachment {
    sender: mpsc::UnboundedSender<Bytes>,
    open: Arc<AtomicBool>,
}

/// The one frame sink the capture loop writes into, valid across reconnects.
/// Holds the two cross-loop mutables: the live channel attachment and the
/// user's streaming toggle.
pub struct FrameOutlet {
    streaming: AtomicBool,
    attachment: Mutex<Option<Attachment>>,
}

impl FrameOutlet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streaming: AtomicBool::new(true),
            attachment: Mutex::new(None),
        })
    }

    pub fn set_streaming(&self, enabled: bool) {
        self.streaming.store(enabled, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub(crate) fn attach(&self, channel: &FrameChannel) {
        *self.attachment.lock() = Some(channel.attachment());
    }

    pub fn detach(&self) {
        *self.attachment.lock() = None;
    }

    /// Send one encoded frame if streaming is enabled and a channel is open;
    /// otherwise the frame is dropped on the floor.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_streaming() {
            return false;
        }
        let guard = self.attachment.lock();
        match guard.as_ref() {
            Some(attachment) if attachment.open.load(Ordering::SeqCst) => {
                telemetry::record_bytes("transport.outbound", frame.len());
                attachment.sender.send(frame).is_ok()
            }
            _ => false,
        }
    }
}

/// Supervises the frame channel for the lifetime of one running session.
pub struct StreamSupervisor {
    task: JoinHandle<()>,
}

impl StreamSupervisor {
    /// Spawn the connection policy for a session that just entered the
    /// running state. `cold_start` is true when the worker was provisioned
    /// during this run and still owes us its warm-up window.
    pub fn spawn(
        endpoints: WorkerEndpoints,
        cold_start: bool,
        lifecycle_rx: watch::Receiver<LifecycleState>,
        outlet: Arc<FrameOutlet>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        notices: Arc<NoticeCenter>,
        cadence: Cadence,
    ) -> Self {
        let task = tokio::spawn(supervise(
            endpoints,
            cold_start,
            lifecycle_rx,
            outlet,
            inbound,
            notices,
            cadence,
        ));
        Self { task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

async fn supervise(
    endpoints: WorkerEndpoints,
    cold_start: bool,
    mut lifecycle_rx: watch::Receiver<LifecycleState>,
    outlet: Arc<FrameOutlet>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    notices: Arc<NoticeCenter>,
    cadence: Cadence,
) {
    if cold_start {
        // Give a freshly provisioned worker time to finish initializing
        // before the first dial.
        if !wait_while_running(&mut lifecycle_rx, cadence.warmup_delay).await {
            outlet.detach();
            return;
        }
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut primed = false;

    loop {
        if !lifecycle_rx.borrow().is_running() {
            break;
        }
        match FrameChannel::connect(endpoints.ws_url(), inbound.clone(), event_tx.clone()).await {
            Ok(channel) => {
                debug!(target: "gendj::transport", url = %endpoints.ws_url(), "frame channel open");
                notices.dismiss(TransientKind::ConnectionTrouble);
                if cold_start && !primed {
                    prime_remote_pipeline(&channel, cadence.warmup_frame_count);
                    primed = true;
                }
                outlet.attach(&channel);

                let intentional = await_close(&mut event_rx, &mut lifecycle_rx).await;
                outlet.detach();
                if intentional {
                    channel.close().await;
                    break;
                }
                drop(channel);
                warn!(target: "gendj::transport", "frame channel closed unexpectedly; reconnecting");
                notices.connection_trouble();
                if !wait_while_running(&mut lifecycle_rx, cadence.reconnect_backoff).await {
                    break;
                }
            }
            Err(err) => {
                warn!(target: "gendj::transport", error = %err, "frame channel connect failed");
                notices.connection_trouble();
                if !wait_while_running(&mut lifecycle_rx, cadence.reconnect_backoff).await {
                    break;
                }
            }
        }
    }
    outlet.detach();
    debug!(target: "gendj::transport", "stream supervisor stopped");
}

/// Push synthetic blank frames through a fresh channel so the remote
/// pipeline is warm before real content is expected to mean anything.
fn prime_remote_pipeline(channel: &FrameChannel, count: usize) {
    match encode_jpeg(&blank_frame()) {
        Ok(blank) => {
            for _ in 0..count {
                channel.send(blank.clone());
            }
        }
        Err(err) => {
            warn!(target: "gendj::transport", error = %err, "could not encode warm-up frame");
        }
    }
}

/// Wait until the channel reports closed or the session stops running.
/// Returns true when the close is intentional (session no longer running).
async fn await_close(
    event_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    lifecycle_rx: &mut watch::Receiver<LifecycleState>,
) -> bool {
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(ChannelEvent::Closed) | None => return false,
                Some(ChannelEvent::Opened) => {}
            },
            changed = lifecycle_rx.changed() => {
                if changed.is_err() || !lifecycle_rx.borrow().is_running() {
                    return true;
                }
            }
        }
    }
}

/// Sleep for `delay`, bailing out early if the session leaves the running
/// state. Returns true when the session is still running afterwards.
async fn wait_while_running(
    lifecycle_rx: &mut watch::Receiver<LifecycleState>,
    delay: Duration,
) -> bool {
    if !lifecycle_rx.borrow().is_running() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return lifecycle_rx.borrow().is_running(),
            changed = lifecycle_rx.changed() => {
                if changed.is_err() || !lifecycle_rx.borrow().is_running() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlet_without_channel_drops_frames() {
        let outlet = FrameOutlet::new();
        assert!(outlet.is_streaming());
        assert!(!outlet.send(Bytes::from_static(b"frame")));
    }

    #[test]
    fn outlet_respects_streaming_toggle() {
        let outlet = FrameOutlet::new();
        outlet.set_streaming(false);
        assert!(!outlet.is_streaming());
        assert!(!outlet.send(Bytes::from_static(b"frame")));
    }
}
