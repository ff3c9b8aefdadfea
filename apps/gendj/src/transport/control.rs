//! Worker control plane: prompt submission (with the moderation flag riding
//! on a successful response) and blend updates, the latter rate limited
//! client side so a fader sweep does not flood the worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::{TransportError, WorkerEndpoints};
use crate::config::BlendPacing;
use crate::deck::PromptSlot;
use crate::notice::NoticeCenter;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error(transparent)]
    Endpoint(#[from] TransportError),
}

#[async_trait]
pub(crate) trait ControlBackend: Send + Sync {
    async fn post_prompt(&self, url: Url) -> Result<String, ControlError>;
    async fn post_blend(&self, url: Url) -> Result<(), ControlError>;
}

struct ReqwestControlBackend {
    client: reqwest::Client,
}

impl ReqwestControlBackend {
    fn new() -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ControlBackend for ReqwestControlBackend {
    async fn post_prompt(&self, url: Url) -> Result<String, ControlError> {
        let response = self.client.post(url).send().await?;
        if !response.status().is_success() {
            return Err(ControlError::HttpStatus(response.status()));
        }
        Ok(response.text().await?)
    }

    async fn post_blend(&self, url: Url) -> Result<(), ControlError> {
        let response = self.client.post(url).send().await?;
        if !response.status().is_success() {
            return Err(ControlError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

/// Prompt/blend client for one worker.
#[derive(Clone)]
pub struct ControlClient {
    endpoints: WorkerEndpoints,
    backend: Arc<dyn ControlBackend>,
    notices: Arc<NoticeCenter>,
}

impl ControlClient {
    pub fn new(
        endpoints: WorkerEndpoints,
        notices: Arc<NoticeCenter>,
    ) -> Result<Self, ControlError> {
        let backend = Arc::new(ReqwestControlBackend::new()?);
        Ok(Self {
            endpoints,
            backend,
            notices,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(
        endpoints: WorkerEndpoints,
        backend: Arc<dyn ControlBackend>,
        notices: Arc<NoticeCenter>,
    ) -> Self {
        Self {
            endpoints,
            backend,
            notices,
        }
    }

    /// Submit a prompt. A successful response whose body parses as JSON with
    /// `"safety": "unsafe"` raises the moderation warning; it is not an
    /// error.
    pub async fn send_prompt(&self, slot: PromptSlot, text: &str) -> Result<(), ControlError> {
        let url = self.endpoints.prompt_url(slot, text)?;
        let body = self.backend.post_prompt(url).await?;
        if body.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => {
                if value.get("safety").and_then(|v| v.as_str()) == Some("unsafe") {
                    self.notices.moderation_warning();
                }
            }
            Err(err) => {
                debug!(target: "gendj::control", error = %err, "prompt response is not json; ignoring");
            }
        }
        Ok(())
    }

    pub async fn send_blend(&self, value: f64) -> Result<(), ControlError> {
        let url = self.endpoints.blend_url(value)?;
        self.backend.post_blend(url).await
    }
}

/// Rate-limited blend fader feed: at most one post per `min_interval`, with
/// any value arriving inside that window coalesced and flushed
/// `trailing_flush` after the last post, so the final fader position always
/// lands.
pub struct BlendLimiter {
    tx: mpsc::UnboundedSender<f64>,
    task: JoinHandle<()>,
}

impl BlendLimiter {
    pub fn spawn(client: ControlClient, pacing: BlendPacing) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_limiter(client, pacing, rx));
        Self { tx, task }
    }

    pub fn submit(&self, value: f64) {
        let _ = self.tx.send(value);
    }

    /// Flushes any coalesced trailing value, then stops.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run_limiter(client: ControlClient, pacing: BlendPacing, mut rx: mpsc::UnboundedReceiver<f64>) {
    let mut last_sent: Option<Instant> = None;
    let mut pending: Option<f64> = None;

    loop {
        let flush_at = pending.map(|_| match last_sent {
            Some(at) => at + pacing.trailing_flush,
            None => Instant::now(),
        });
        tokio::select! {
            received = rx.recv() => match received {
                Some(value) => {
                    let now = Instant::now();
                    let spaced_out = last_sent
                        .map_or(true, |at| now.duration_since(at) >= pacing.min_interval);
                    if spaced_out {
                        post_blend(&client, value).await;
                        last_sent = Some(now);
                        pending = None;
                    } else {
                        pending = Some(value);
                    }
                }
                None => {
                    if let Some(value) = pending.take() {
                        post_blend(&client, value).await;
                    }
                    break;
                }
            },
            _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                if let Some(value) = pending.take() {
                    post_blend(&client, value).await;
                    last_sent = Some(Instant::now());
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}

async fn post_blend(client: &ControlClient, value: f64) {
    if let Err(err) = client.send_blend(value).await {
        warn!(target: "gendj::control", error = %err, "blend post failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    pub(crate) struct RecordingBackend {
        pub prompt_response: Mutex<String>,
        pub prompts: Mutex<Vec<Url>>,
        pub blends: Mutex<Vec<f64>>,
    }

    impl RecordingBackend {
        fn new(prompt_response: &str) -> Arc<Self> {
            Arc::new(Self {
                prompt_response: Mutex::new(prompt_response.to_string()),
                prompts: Mutex::new(Vec::new()),
                blends: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ControlBackend for RecordingBackend {
        async fn post_prompt(&self, url: Url) -> Result<String, ControlError> {
            self.prompts.lock().push(url);
            Ok(self.prompt_response.lock().clone())
        }

        async fn post_blend(&self, url: Url) -> Result<(), ControlError> {
            let value: f64 = url
                .path_segments()
                .and_then(|mut segments| segments.nth(1))
                .and_then(|raw| raw.parse().ok())
                .expect("blend url carries a numeric value");
            self.blends.lock().push(value);
            Ok(())
        }
    }

    fn client(backend: Arc<RecordingBackend>) -> (ControlClient, tokio::sync::mpsc::UnboundedReceiver<crate::notice::Notice>) {
        let endpoints = WorkerEndpoints::for_worker("abc123", "proxy.runpod.net").unwrap();
        let (notices, notice_rx) = NoticeCenter::channel();
        (
            ControlClient::with_backend(endpoints, backend, notices),
            notice_rx,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn prompt_posts_to_slot_path() {
        let backend = RecordingBackend::new("ok");
        let (client, _notices) = client(backend.clone());

        client
            .send_prompt(PromptSlot::Two, "marble statue")
            .await
            .unwrap();
        let posted = backend.prompts.lock();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].path().starts_with("/second_prompt/"));
        assert!(posted[0].path().contains("marble%20statue"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsafe_flag_raises_moderation_warning() {
        let backend = RecordingBackend::new(r#"{"safety": "unsafe"}"#);
        let (client, mut notices) = client(backend);

        client.send_prompt(PromptSlot::One, "x").await.unwrap();
        assert!(matches!(
            notices.try_recv(),
            Ok(crate::notice::Notice::Transient {
                kind: crate::notice::TransientKind::Moderation,
                ..
            })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn safe_and_non_json_responses_raise_nothing() {
        let backend = RecordingBackend::new(r#"{"safety": "ok"}"#);
        let (client, mut notices) = client(backend.clone());
        client.send_prompt(PromptSlot::One, "x").await.unwrap();
        assert!(notices.try_recv().is_err());

        *backend.prompt_response.lock() = "plain text ack".to_string();
        client.send_prompt(PromptSlot::One, "y").await.unwrap();
        assert!(notices.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn blend_burst_collapses_to_leading_and_trailing_edge() {
        let backend = RecordingBackend::new("ok");
        let (client, _notices) = client(backend.clone());
        let limiter = BlendLimiter::spawn(client, BlendPacing::default());

        for value in [0.1, 0.2, 0.3, 0.4, 0.5] {
            limiter.submit(value);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let blends = backend.blends.lock().clone();
        assert_eq!(blends.first(), Some(&0.1), "leading edge posts immediately");
        assert_eq!(blends.last(), Some(&0.5), "trailing value always lands");
        assert!(blends.len() <= 3, "burst must coalesce, got {blends:?}");
        limiter.shutdown().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn spaced_submissions_all_post() {
        let backend = RecordingBackend::new("ok");
        let (client, _notices) = client(backend.clone());
        let limiter = BlendLimiter::spawn(client, BlendPacing::default());

        for value in [0.25, 0.75] {
            limiter.submit(value);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        limiter.shutdown().await;
        assert_eq!(backend.blends.lock().clone(), vec![0.25, 0.75]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_flushes_pending_value() {
        let backend = RecordingBackend::new("ok");
        let (client, _notices) = client(backend.clone());
        let limiter = BlendLimiter::spawn(client, BlendPacing::default());

        limiter.submit(0.1);
        limiter.submit(0.9);
        limiter.shutdown().await;
        let blends = backend.blends.lock().clone();
        assert_eq!(blends, vec![0.1, 0.9]);
    }
}
