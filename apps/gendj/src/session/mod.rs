pub mod lifecycle;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    base_url: Url,
    bearer_token: Option<String>,
}

impl SessionConfig {
    pub fn new(api_base_url: impl AsRef<str>) -> Result<Self, SessionError> {
        // Allow a centralized override so callers and env stay consistent.
        let mut base = std::env::var("GENDJ_SESSION_API_BASE")
            .ok()
            .and_then(|s| {
                let trimmed = s.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
            .unwrap_or_else(|| api_base_url.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "session api base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid session api url: {err}")))?;
        Ok(Self {
            base_url: parsed,
            bearer_token: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base.split('/').next().unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("127.")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("192.168.")
        || host_lower.starts_with("10.")
    {
        "http://"
    } else {
        "https://"
    }
}

/// Remote job status of a warp, as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One remote warp session record.
///
/// `worker_id` is present exactly when the job has reached `IN_PROGRESS` at
/// least once; the streaming transport must never be built without it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarpSession {
    pub id: String,
    pub job_status: JobStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub estimated_time_balance: Option<f64>,
}

impl WarpSession {
    fn validated(self) -> Result<Self, SessionError> {
        if self.job_status == JobStatus::InProgress && self.worker_id.is_none() {
            return Err(SessionError::InvalidResponse(format!(
                "warp {} is IN_PROGRESS but has no worker id",
                self.id
            )));
        }
        Ok(self)
    }
}

/// A warp record plus the entitlement balance the same response carried.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub warp: WarpSession,
    pub time_balance: Option<f64>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("warp session no longer exists")]
    SessionLost,
    #[error("time balance exhausted")]
    BalanceExhausted,
}

#[async_trait]
pub(crate) trait SessionBackend: Send + Sync {
    async fn create_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
    ) -> Result<WarpEnvelope, SessionError>;

    async fn poll_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<WarpEnvelope, SessionError>;

    async fn heartbeat(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<HeartbeatEnvelope, SessionError>;

    async fn end_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<WarpEnvelope, SessionError>;
}

/// Warp API client. Create, poll, heartbeat and end calls all funnel through
/// a backend trait so tests run against an in-memory server.
#[derive(Clone)]
pub struct SessionClient {
    config: Arc<SessionConfig>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionClient {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_backend(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn create(&self) -> Result<SessionSnapshot, SessionError> {
        let envelope = self
            .backend
            .create_warp(self.config.base_url(), self.config.bearer_token())
            .await?;
        let snapshot = envelope.into_snapshot()?;
        tracing::debug!(
            target = "gendj::session",
            warp_id = %snapshot.warp.id,
            status = ?snapshot.warp.job_status,
            "warp session created"
        );
        Ok(snapshot)
    }

    pub async fn poll(&self, warp_id: &str) -> Result<SessionSnapshot, SessionError> {
        let envelope = self
            .backend
            .poll_warp(self.config.base_url(), self.config.bearer_token(), warp_id)
            .await?;
        envelope.into_snapshot()
    }

    /// Refreshes the entitlement balance. `Err(BalanceExhausted)` means the
    /// server refused to keep the warp alive.
    pub async fn heartbeat(&self, warp_id: &str) -> Result<Option<f64>, SessionError> {
        let envelope = self
            .backend
            .heartbeat(self.config.base_url(), self.config.bearer_token(), warp_id)
            .await?;
        Ok(envelope.estimated_user_time_balance)
    }

    pub async fn end(&self, warp_id: &str) -> Result<SessionSnapshot, SessionError> {
        let envelope = self
            .backend
            .end_warp(self.config.base_url(), self.config.bearer_token(), warp_id)
            .await?;
        envelope.into_snapshot()
    }
}

/// `{ "entities": { "warps": [...] }, "estimatedUserTimeBalance": ... }`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WarpEnvelope {
    #[serde(default)]
    entities: Option<WarpEntities>,
    #[serde(default)]
    estimated_user_time_balance: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub(crate) struct WarpEntities {
    #[serde(default)]
    warps: Vec<WarpSession>,
}

impl WarpEnvelope {
    pub(crate) fn of(warp: WarpSession, balance: Option<f64>) -> Self {
        Self {
            entities: Some(WarpEntities { warps: vec![warp] }),
            estimated_user_time_balance: balance,
            message: None,
        }
    }

    fn into_snapshot(self) -> Result<SessionSnapshot, SessionError> {
        let warp = self
            .entities
            .and_then(|entities| entities.warps.into_iter().next());
        match warp {
            Some(warp) => Ok(SessionSnapshot {
                warp: warp.validated()?,
                time_balance: self.estimated_user_time_balance,
            }),
            None => match self.message {
                Some(message) => Err(SessionError::Server(message)),
                None => Err(SessionError::InvalidResponse(
                    "response carried no warp record".into(),
                )),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeartbeatEnvelope {
    #[serde(default)]
    pub(crate) estimated_user_time_balance: Option<f64>,
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, SessionError> {
        base_url
            .join(path)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn create_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
    ) -> Result<WarpEnvelope, SessionError> {
        let endpoint = Self::endpoint(base_url, "v1/warps")?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(&serde_json::json!({})).send().await?;
        if !response.status().is_success() {
            // Creation errors usually carry a message worth surfacing.
            if let Ok(envelope) = response.json::<WarpEnvelope>().await {
                if let Some(message) = envelope.message {
                    return Err(SessionError::Server(message));
                }
            }
            return Err(SessionError::InvalidResponse(
                "warp creation rejected".into(),
            ));
        }
        Ok(response.json::<WarpEnvelope>().await?)
    }

    async fn poll_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<WarpEnvelope, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("v1/warps/{warp_id}"))?;
        let mut builder = self.client.get(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(SessionError::SessionLost),
            status if !status.is_success() => Err(SessionError::HttpStatus(status)),
            _ => Ok(response.json::<WarpEnvelope>().await?),
        }
    }

    async fn heartbeat(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<HeartbeatEnvelope, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("v1/warps/{warp_id}/heartbeat"))?;
        let mut builder = self.client.post(endpoint).json(&serde_json::json!({}));
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        match response.status() {
            StatusCode::PAYMENT_REQUIRED => Err(SessionError::BalanceExhausted),
            status if !status.is_success() => Err(SessionError::HttpStatus(status)),
            _ => Ok(response.json::<HeartbeatEnvelope>().await?),
        }
    }

    async fn end_warp(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        warp_id: &str,
    ) -> Result<WarpEnvelope, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("v1/warps/{warp_id}/end"))?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        Ok(response.json::<WarpEnvelope>().await?)
    }
}

/// "H hours M minutes" / "M minutes" rendering of a seconds balance.
pub fn format_time_balance(seconds: f64) -> String {
    let minutes = (seconds / 60.0).floor() as u64;
    let hours = minutes / 60;
    let remaining_minutes = minutes % 60;
    if hours > 0 {
        format!("{hours} hours {remaining_minutes} minutes")
    } else {
        format!("{remaining_minutes} minutes")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory warp API used by session and lifecycle tests. Scripted polls
    /// are consumed in order; the last entry repeats.
    pub(crate) struct MockSessionBackend {
        pub created: Mutex<Option<WarpSession>>,
        pub created_balance: Mutex<Option<f64>>,
        pub poll_script: Mutex<Vec<Result<WarpEnvelope, ScriptedError>>>,
        pub heartbeat_script: Mutex<Vec<Result<Option<f64>, ScriptedError>>>,
        pub ended: Mutex<Vec<String>>,
        pub poll_count: Mutex<usize>,
        pub heartbeat_count: Mutex<usize>,
    }

    /// Cloneable stand-ins for the error variants scripts need.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum ScriptedError {
        Lost,
        Balance,
        Transient,
    }

    impl ScriptedError {
        fn into_error(self) -> SessionError {
            match self {
                ScriptedError::Lost => SessionError::SessionLost,
                ScriptedError::Balance => SessionError::BalanceExhausted,
                ScriptedError::Transient => {
                    SessionError::HttpStatus(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
    }

    impl MockSessionBackend {
        pub(crate) fn new() -> Self {
            Self {
                created: Mutex::new(None),
                created_balance: Mutex::new(None),
                poll_script: Mutex::new(Vec::new()),
                heartbeat_script: Mutex::new(Vec::new()),
                ended: Mutex::new(Vec::new()),
                poll_count: Mutex::new(0),
                heartbeat_count: Mutex::new(0),
            }
        }

        pub(crate) fn warp(id: &str, status: JobStatus, worker: Option<&str>) -> WarpSession {
            WarpSession {
                id: id.to_string(),
                job_status: status,
                worker_id: worker.map(str::to_string),
                estimated_time_balance: None,
            }
        }
    }

    #[async_trait]
    impl SessionBackend for MockSessionBackend {
        async fn create_warp(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
        ) -> Result<WarpEnvelope, SessionError> {
            match self.created.lock().clone() {
                Some(warp) => Ok(WarpEnvelope::of(warp, *self.created_balance.lock())),
                None => Err(SessionError::Server("no capacity".into())),
            }
        }

        async fn poll_warp(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            _warp_id: &str,
        ) -> Result<WarpEnvelope, SessionError> {
            *self.poll_count.lock() += 1;
            let mut script = self.poll_script.lock();
            let step = if script.len() > 1 {
                script.remove(0)
            } else {
                match script.first() {
                    Some(step) => step.clone(),
                    None => Err(ScriptedError::Transient),
                }
            };
            step.map_err(ScriptedError::into_error)
        }

        async fn heartbeat(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            _warp_id: &str,
        ) -> Result<HeartbeatEnvelope, SessionError> {
            *self.heartbeat_count.lock() += 1;
            let mut script = self.heartbeat_script.lock();
            let step = if script.is_empty() {
                Ok(None)
            } else if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            };
            step.map(|balance| HeartbeatEnvelope {
                estimated_user_time_balance: balance,
            })
            .map_err(ScriptedError::into_error)
        }

        async fn end_warp(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            warp_id: &str,
        ) -> Result<WarpEnvelope, SessionError> {
            self.ended.lock().push(warp_id.to_string());
            Ok(WarpEnvelope::of(
                WarpSession {
                    id: warp_id.to_string(),
                    job_status: JobStatus::Cancelled,
                    worker_id: None,
                    estimated_time_balance: None,
                },
                None,
            ))
        }
    }
}
