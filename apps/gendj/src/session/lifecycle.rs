//! Remote warp lifecycle: one tagged state value per session, driven by the
//! queue poller and the heartbeat. Terminal states latch; once a session has
//! ended nothing restarts polling, heartbeats or transport reconnection.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobStatus, SessionClient, SessionError, SessionSnapshot, WarpSession};
use crate::config::Cadence;
use crate::notice::NoticeCenter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ServerTerminal,
    UserEnded,
    BalanceExhausted,
    SessionLost,
    CreationFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Creating,
    Queued {
        session: WarpSession,
    },
    Running {
        session: WarpSession,
        /// True when the worker was provisioned during this run (the stream
        /// supervisor owes it a warm-up window before connecting).
        cold_start: bool,
    },
    Ended {
        status: JobStatus,
        reason: EndReason,
    },
}

impl LifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Ended { .. })
    }

    pub fn session(&self) -> Option<&WarpSession> {
        match self {
            LifecycleState::Queued { session } | LifecycleState::Running { session, .. } => {
                Some(session)
            }
            _ => None,
        }
    }
}

pub struct Lifecycle {
    client: SessionClient,
    cadence: Cadence,
    notices: Arc<NoticeCenter>,
    state_tx: watch::Sender<LifecycleState>,
    balance_tx: watch::Sender<Option<f64>>,
}

impl Lifecycle {
    pub fn new(
        client: SessionClient,
        cadence: Cadence,
        notices: Arc<NoticeCenter>,
    ) -> (Arc<Self>, watch::Receiver<LifecycleState>) {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Creating);
        let (balance_tx, _) = watch::channel(None);
        (
            Arc::new(Self {
                client,
                cadence,
                notices,
                state_tx,
                balance_tx,
            }),
            state_rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn balance(&self) -> watch::Receiver<Option<f64>> {
        self.balance_tx.subscribe()
    }

    pub fn current(&self) -> LifecycleState {
        self.state_tx.borrow().clone()
    }

    /// Create the warp on the server. A response that is already
    /// `IN_PROGRESS` attaches to a pre-existing worker, so the stream may
    /// connect without a warm-up window.
    pub async fn create(&self) {
        match self.client.create().await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot, true);
            }
            Err(err) => {
                self.notices.fatal(format!(
                    "Could not start a warp: {err}\ncontact@gendj.com if the problem continues"
                ));
                self.transition(LifecycleState::Ended {
                    status: JobStatus::Failed,
                    reason: EndReason::CreationFailed,
                });
            }
        }
    }

    /// Dev shortcut: attach to a known worker without going through the
    /// queue. The session is running from the start.
    pub fn adopt_local(&self, worker_id: &str) {
        let session = WarpSession {
            id: format!("local-{}", Uuid::new_v4()),
            job_status: JobStatus::InProgress,
            worker_id: Some(worker_id.to_string()),
            estimated_time_balance: None,
        };
        self.transition(LifecycleState::Running {
            session,
            cold_start: false,
        });
    }

    /// One queue poll. Transient failures leave the state untouched so the
    /// driver simply polls again; a 404 means the session is gone for good.
    pub async fn poll_once(&self) {
        let Some(warp_id) = self.session_id() else {
            return;
        };
        match self.client.poll(&warp_id).await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot, false);
            }
            Err(SessionError::SessionLost) => {
                self.notices
                    .fatal("The warp session was lost. Please start a new one.");
                self.transition(LifecycleState::Ended {
                    status: JobStatus::Failed,
                    reason: EndReason::SessionLost,
                });
            }
            Err(err) => {
                warn!(target: "gendj::session", warp_id = %warp_id, error = %err, "poll failed; will retry");
            }
        }
    }

    /// One heartbeat. Refreshes the entitlement balance; a payment-required
    /// answer cancels the warp.
    pub async fn heartbeat_once(&self) {
        let Some(warp_id) = self.session_id() else {
            return;
        };
        match self.client.heartbeat(&warp_id).await {
            Ok(balance) => {
                if balance.is_some() {
                    self.balance_tx.send_replace(balance);
                }
            }
            Err(SessionError::BalanceExhausted) => {
                self.notices
                    .fatal("Time balance exhausted. The warp has ended.");
                self.transition(LifecycleState::Ended {
                    status: JobStatus::Cancelled,
                    reason: EndReason::BalanceExhausted,
                });
            }
            Err(err) => {
                warn!(target: "gendj::session", warp_id = %warp_id, error = %err, "heartbeat failed; will retry");
            }
        }
    }

    /// User-initiated end. The server call is best-effort; locally the
    /// session is over either way.
    pub async fn end(&self) {
        if let Some(warp_id) = self.session_id() {
            match self.client.end(&warp_id).await {
                Ok(snapshot) => {
                    debug!(target: "gendj::session", warp_id = %warp_id, status = ?snapshot.warp.job_status, "warp ended")
                }
                Err(err) => {
                    warn!(target: "gendj::session", warp_id = %warp_id, error = %err, "end call failed")
                }
            }
        }
        self.transition(LifecycleState::Ended {
            status: JobStatus::Cancelled,
            reason: EndReason::UserEnded,
        });
    }

    /// Periodic driver: polls while queued, heartbeats while running, exits
    /// once the session reaches a terminal state.
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = lifecycle.subscribe();
            loop {
                let wait = match &*rx.borrow_and_update() {
                    LifecycleState::Creating => None,
                    LifecycleState::Queued { .. } => Some(lifecycle.cadence.poll_interval),
                    LifecycleState::Running { .. } => Some(lifecycle.cadence.heartbeat_interval),
                    LifecycleState::Ended { .. } => break,
                };
                match wait {
                    Some(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => match lifecycle.current() {
                                LifecycleState::Queued { .. } => lifecycle.poll_once().await,
                                LifecycleState::Running { .. } => lifecycle.heartbeat_once().await,
                                _ => {}
                            },
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "gendj::session", "lifecycle driver stopped");
        })
    }

    fn session_id(&self) -> Option<String> {
        self.current().session().map(|session| session.id.clone())
    }

    fn apply_snapshot(&self, snapshot: SessionSnapshot, from_creation: bool) {
        let SessionSnapshot {
            warp: mut session,
            time_balance,
        } = snapshot;
        // Balance rides its own channel so refreshes never look like
        // lifecycle transitions to subscribers.
        let balance = time_balance.or(session.estimated_time_balance.take());
        if balance.is_some() {
            self.balance_tx.send_replace(balance);
        }

        let next = match session.job_status {
            JobStatus::InQueue => LifecycleState::Queued { session },
            JobStatus::InProgress => LifecycleState::Running {
                session,
                cold_start: !from_creation,
            },
            status => LifecycleState::Ended {
                status,
                reason: EndReason::ServerTerminal,
            },
        };
        self.transition(next);
    }

    fn transition(&self, next: LifecycleState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next.clone();
            true
        });
        if changed {
            info!(target: "gendj::session", state = ?self.state_tx.borrow().clone(), "lifecycle transition");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{MockSessionBackend, ScriptedError};
    use crate::session::{SessionConfig, WarpEnvelope};
    use std::time::Duration;

    fn harness(backend: Arc<MockSessionBackend>) -> (Arc<Lifecycle>, watch::Receiver<LifecycleState>) {
        let config = SessionConfig::new("http://mock.server").unwrap();
        let client = SessionClient::with_backend(config, backend);
        let (notices, _notice_rx) = NoticeCenter::channel();
        Lifecycle::new(client, Cadence::default(), notices)
    }

    fn queued_warp() -> WarpSession {
        MockSessionBackend::warp("w-1", JobStatus::InQueue, None)
    }

    fn running_warp() -> WarpSession {
        MockSessionBackend::warp("w-1", JobStatus::InProgress, Some("worker-7"))
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_with_queue_then_poll_reaches_running_once() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(queued_warp());
        backend.poll_script.lock().push(Ok(WarpEnvelope::of(running_warp(), None)));
        let (lifecycle, mut rx) = harness(backend);

        lifecycle.create().await;
        assert!(matches!(lifecycle.current(), LifecycleState::Queued { .. }));
        rx.borrow_and_update();

        lifecycle.poll_once().await;
        match lifecycle.current() {
            LifecycleState::Running {
                session,
                cold_start,
            } => {
                assert_eq!(session.worker_id.as_deref(), Some("worker-7"));
                assert!(cold_start, "a queue->running transition is a cold start");
            }
            other => panic!("expected running, got {other:?}"),
        }
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Identical repeated polls must not re-announce the transition.
        lifecycle.poll_once().await;
        lifecycle.poll_once().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_already_in_progress_is_not_a_cold_start() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(running_warp());
        let (lifecycle, _rx) = harness(backend);

        lifecycle.create().await;
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Running {
                cold_start: false,
                ..
            }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn creation_failure_is_terminal_and_fatal() {
        let backend = Arc::new(MockSessionBackend::new());
        let config = SessionConfig::new("http://mock.server").unwrap();
        let client = SessionClient::with_backend(config, backend);
        let (notices, mut notice_rx) = NoticeCenter::channel();
        let (lifecycle, _rx) = Lifecycle::new(client, Cadence::default(), notices);

        lifecycle.create().await;
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                status: JobStatus::Failed,
                reason: EndReason::CreationFailed,
            }
        ));
        assert!(matches!(
            notice_rx.try_recv(),
            Ok(crate::notice::Notice::Fatal(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn transient_poll_errors_keep_polling_state() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(queued_warp());
        backend.poll_script.lock().push(Err(ScriptedError::Transient));
        let (lifecycle, _rx) = harness(backend.clone());

        lifecycle.create().await;
        lifecycle.poll_once().await;
        lifecycle.poll_once().await;
        assert!(matches!(lifecycle.current(), LifecycleState::Queued { .. }));
        assert_eq!(*backend.poll_count.lock(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn lost_session_stops_polling_permanently() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(queued_warp());
        backend.poll_script.lock().push(Err(ScriptedError::Lost));
        let (lifecycle, _rx) = harness(backend.clone());

        lifecycle.create().await;
        lifecycle.poll_once().await;
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                reason: EndReason::SessionLost,
                ..
            }
        ));

        // The session id is gone; another tick must not hit the backend.
        lifecycle.poll_once().await;
        assert_eq!(*backend.poll_count.lock(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn terminal_poll_status_ends_the_session() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(queued_warp());
        backend.poll_script.lock().push(Ok(WarpEnvelope::of(
            MockSessionBackend::warp("w-1", JobStatus::Failed, None),
            None,
        )));
        let (lifecycle, _rx) = harness(backend);

        lifecycle.create().await;
        lifecycle.poll_once().await;
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                status: JobStatus::Failed,
                reason: EndReason::ServerTerminal,
            }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn heartbeat_refreshes_balance() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(running_warp());
        backend.heartbeat_script.lock().push(Ok(Some(512.0)));
        let (lifecycle, _rx) = harness(backend);

        lifecycle.create().await;
        lifecycle.heartbeat_once().await;
        assert_eq!(*lifecycle.balance().borrow(), Some(512.0));
        assert!(lifecycle.current().is_running());
    }

    #[test_timeout::tokio_timeout_test]
    async fn exhausted_balance_cancels_the_warp() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(running_warp());
        backend.heartbeat_script.lock().push(Err(ScriptedError::Balance));
        let (lifecycle, _rx) = harness(backend.clone());

        lifecycle.create().await;
        lifecycle.heartbeat_once().await;
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                status: JobStatus::Cancelled,
                reason: EndReason::BalanceExhausted,
            }
        ));

        lifecycle.heartbeat_once().await;
        assert_eq!(*backend.heartbeat_count.lock(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn user_end_calls_endpoint_and_latches() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(running_warp());
        let (lifecycle, _rx) = harness(backend.clone());

        lifecycle.create().await;
        lifecycle.end().await;
        assert_eq!(backend.ended.lock().as_slice(), ["w-1".to_string()]);
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                reason: EndReason::UserEnded,
                ..
            }
        ));

        // Terminal states latch: a late poll result cannot resurrect it.
        lifecycle.poll_once().await;
        assert!(lifecycle.current().is_terminal());
    }

    #[test_timeout::tokio_timeout_test]
    async fn adopt_local_runs_without_warmup() {
        let backend = Arc::new(MockSessionBackend::new());
        let (lifecycle, _rx) = harness(backend);

        lifecycle.adopt_local("ws://127.0.0.1:9000");
        match lifecycle.current() {
            LifecycleState::Running {
                session,
                cold_start,
            } => {
                assert!(!cold_start);
                assert_eq!(session.worker_id.as_deref(), Some("ws://127.0.0.1:9000"));
            }
            other => panic!("expected running, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn driver_advances_queue_to_cancelled_end_to_end() {
        let backend = Arc::new(MockSessionBackend::new());
        *backend.created.lock() = Some(queued_warp());
        backend.poll_script.lock().push(Ok(WarpEnvelope::of(running_warp(), None)));
        backend.heartbeat_script.lock().push(Err(ScriptedError::Balance));

        let config = SessionConfig::new("http://mock.server").unwrap();
        let client = SessionClient::with_backend(config, backend);
        let (notices, _notice_rx) = NoticeCenter::channel();
        let cadence = Cadence {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(10),
            ..Cadence::default()
        };
        let (lifecycle, mut rx) = Lifecycle::new(client, cadence, notices);

        lifecycle.create().await;
        let driver = lifecycle.spawn_driver();

        loop {
            rx.changed().await.unwrap();
            if rx.borrow().is_terminal() {
                break;
            }
        }
        assert!(matches!(
            lifecycle.current(),
            LifecycleState::Ended {
                reason: EndReason::BalanceExhausted,
                ..
            }
        ));
        driver.await.unwrap();
    }
}
