//! One controller object per warp session. It owns every loop the engine
//! runs (capture, render, lifecycle driver, stream supervisor, blend
//! limiter) and starts/stops them explicitly at session boundaries.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliError;
use crate::config::Config;
use crate::deck::{Deck, DeckEffect};
use crate::frame::capture::{self, CaptureCommand, CaptureHandle};
use crate::frame::render::{self, NullSink, PreviewWriter, RenderSink};
use crate::frame::source::{FileSource, FrameSource, SourceCatalog, SyntheticSource};
use crate::frame::{Stride, FRAME_RATE};
use crate::midi::mapping::{MappingStore, MidiMapping};
use crate::midi::{Mapper, MapperEvent};
use crate::notice::{Notice, NoticeCenter};
use crate::session::lifecycle::{Lifecycle, LifecycleState};
use crate::session::{format_time_balance, SessionClient, SessionConfig};
use crate::transport::control::{BlendLimiter, ControlClient};
use crate::transport::frames::{FrameOutlet, StreamSupervisor};
use crate::transport::WorkerEndpoints;

#[derive(Debug, Default)]
pub struct AppOptions {
    /// Directory of images used as the file-backed capture source.
    pub frames_dir: Option<PathBuf>,
    /// Attach to this worker directly instead of creating a session.
    pub local_worker: Option<String>,
    /// Stride override; persisted as the new preference when set.
    pub stride: Option<Stride>,
    /// Write the most recent warped frame here as PNG.
    pub preview: Option<PathBuf>,
    /// Start with outbound streaming disabled.
    pub paused: bool,
    /// Listen to connected MIDI controllers.
    pub midi: bool,
}

pub async fn run(config: Config, options: AppOptions) -> Result<(), CliError> {
    let (notices, notice_rx) = NoticeCenter::channel();
    let notice_task = tokio::spawn(report_notices(notice_rx));

    // Durable local state: learned MIDI table and the stride preference.
    let (stride, mut mapper) = match MappingStore::open_default() {
        Ok(store) => {
            let stored = store.load_stride().unwrap_or_else(|err| {
                warn!(target: "gendj::app", error = %err, "could not load stride preference");
                None
            });
            let stride = options.stride.or(stored).unwrap_or_default();
            if let Some(chosen) = options.stride {
                if let Err(err) = store.save_stride(chosen) {
                    warn!(target: "gendj::app", error = %err, "could not persist stride preference");
                }
            }
            (stride, Mapper::with_store(store))
        }
        Err(err) => {
            warn!(target: "gendj::app", error = %err, "no durable state dir; midi mapping will not persist");
            (
                options.stride.unwrap_or_default(),
                Mapper::new(MidiMapping::default()),
            )
        }
    };

    // Capture sources: the file surrogate when given, always the synthetic
    // fallback so device cycling has somewhere to land.
    let mut sources: Vec<Box<dyn FrameSource>> = Vec::new();
    if let Some(dir) = &options.frames_dir {
        sources.push(Box::new(FileSource::open(dir)?));
    }
    sources.push(Box::new(SyntheticSource::new("Test pattern")));
    let catalog = SourceCatalog::new(sources);
    let device_count = catalog.device_count();
    let mut deck = Deck::new(device_count);

    let outlet = FrameOutlet::new();
    outlet.set_streaming(!options.paused);
    let capture = capture::spawn(catalog, outlet.clone(), stride);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let sink: Box<dyn RenderSink> = match &options.preview {
        Some(path) => Box::new(PreviewWriter::new(path.clone())),
        None => Box::new(NullSink),
    };
    let render = render::spawn(inbound_rx, sink, FRAME_RATE);

    // Session lifecycle.
    let session_config =
        SessionConfig::new(&config.api_base)?.with_bearer_token(config.api_token.clone());
    let client = SessionClient::new(session_config)?;
    let (lifecycle, mut lifecycle_rx) = Lifecycle::new(client, config.cadence, notices.clone());
    match &options.local_worker {
        Some(worker) => lifecycle.adopt_local(worker),
        None => lifecycle.create().await,
    }
    let driver = lifecycle.spawn_driver();

    let mut balance_rx = lifecycle.balance();
    let balance_task = tokio::spawn(async move {
        while balance_rx.changed().await.is_ok() {
            let balance = *balance_rx.borrow();
            if let Some(seconds) = balance {
                info!(target: "gendj::app", remaining = %format_time_balance(seconds), "time balance");
            }
        }
    });

    // MIDI input. The sender stays alive even without a hardware bridge so
    // the receive arm below parks instead of spinning on a closed channel.
    let (midi_tx, mut midi_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    #[cfg(feature = "midi-hardware")]
    let _midi_bridge = if options.midi {
        match crate::midi::input::MidiInputBridge::connect_all(midi_tx.clone()) {
            Ok(bridge) => Some(bridge),
            Err(err) => {
                warn!(target: "gendj::app", error = %err, "midi unavailable; continuing without it");
                None
            }
        }
    } else {
        None
    };
    #[cfg(not(feature = "midi-hardware"))]
    if options.midi {
        warn!(target: "gendj::app", "built without the midi-hardware feature; --midi ignored");
    }
    let _midi_tx = midi_tx;

    let mut supervisor: Option<StreamSupervisor> = None;
    let mut control: Option<(ControlClient, BlendLimiter)> = None;

    loop {
        tokio::select! {
            changed = lifecycle_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = lifecycle_rx.borrow_and_update().clone();
                match state {
                    LifecycleState::Running { session, cold_start } if supervisor.is_none() => {
                        let Some(worker) = session.worker_id.clone() else {
                            // Unreachable per the session invariant; refuse to dial blind.
                            notices.fatal("Worker identity missing; cannot stream.");
                            lifecycle.end().await;
                            continue;
                        };
                        match connect_worker(
                            &worker,
                            cold_start,
                            &config,
                            &lifecycle,
                            &outlet,
                            &inbound_tx,
                            &notices,
                        ) {
                            Ok((sup, ctl)) => {
                                supervisor = Some(sup);
                                control = Some(ctl);
                            }
                            Err(err) => {
                                notices.fatal(format!("Cannot reach worker {worker}: {err}"));
                                lifecycle.end().await;
                            }
                        }
                    }
                    LifecycleState::Ended { status, reason } => {
                        info!(target: "gendj::app", ?status, ?reason, "warp session over");
                        break;
                    }
                    _ => {}
                }
            }
            raw = midi_rx.recv() => {
                let Some(raw) = raw else { continue };
                match mapper.handle_raw(&raw) {
                    Some(MapperEvent::Learned { key, action }) => {
                        info!(target: "gendj::app", ?key, ?action, "midi control learned");
                    }
                    Some(MapperEvent::Dispatch { action, value }) => {
                        if let Some(effect) = deck.apply(action, value) {
                            apply_effect(effect, &control, &capture);
                        }
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "gendj::app", "interrupt received; ending warp");
                lifecycle.end().await;
            }
        }
    }

    // Deterministic teardown: every loop stops here, none outlives the
    // session.
    capture.shutdown().await;
    if let Some(supervisor) = supervisor {
        supervisor.stopped().await;
    }
    if let Some((_, limiter)) = control {
        limiter.shutdown().await;
    }
    render.shutdown().await;
    let _ = driver.await;
    balance_task.abort();
    notice_task.abort();
    Ok(())
}

fn connect_worker(
    worker: &str,
    cold_start: bool,
    config: &Config,
    lifecycle: &Arc<Lifecycle>,
    outlet: &Arc<FrameOutlet>,
    inbound_tx: &mpsc::UnboundedSender<crate::frame::render::InboundFrame>,
    notices: &Arc<NoticeCenter>,
) -> Result<(StreamSupervisor, (ControlClient, BlendLimiter)), CliError> {
    let endpoints = WorkerEndpoints::for_worker(worker, &config.proxy_domain)?;
    debug!(target: "gendj::app", ws = %endpoints.ws_url(), "worker endpoints resolved");
    let supervisor = StreamSupervisor::spawn(
        endpoints.clone(),
        cold_start,
        lifecycle.subscribe(),
        outlet.clone(),
        inbound_tx.clone(),
        notices.clone(),
        config.cadence,
    );
    let control_client = ControlClient::new(endpoints, notices.clone())?;
    let limiter = BlendLimiter::spawn(control_client.clone(), config.blend);
    Ok((supervisor, (control_client, limiter)))
}

fn apply_effect(
    effect: DeckEffect,
    control: &Option<(ControlClient, BlendLimiter)>,
    capture: &CaptureHandle,
) {
    match effect {
        DeckEffect::SetBlend(value) => {
            if let Some((_, limiter)) = control {
                limiter.submit(value);
            }
        }
        DeckEffect::SubmitPrompt { slot, text } => {
            if let Some((client, _)) = control {
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(err) = client.send_prompt(slot, &text).await {
                        warn!(target: "gendj::app", error = %err, "prompt submit failed");
                    }
                });
            }
        }
        DeckEffect::SwitchDevice(index) => {
            capture.command(CaptureCommand::SwitchDevice(index));
        }
    }
}

async fn report_notices(mut rx: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Transient { text, .. } => {
                warn!(target: "gendj::app", "{text}");
            }
            Notice::Dismissed(kind) => {
                debug!(target: "gendj::app", ?kind, "notice dismissed");
            }
            Notice::Fatal(text) => {
                eprintln!("❌ {text}");
            }
        }
    }
}
