pub mod control;
pub mod frames;

use thiserror::Error;
use url::Url;

use crate::deck::PromptSlot;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid worker id: {0}")]
    InvalidWorker(String),
    #[error("invalid worker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Endpoints derived from a worker id: the binary frame channel plus the
/// prompt/blend control plane the same worker exposes.
///
/// A plain id maps onto the hosted proxy scheme
/// (`wss://{id}-8766.{proxy}` / `https://{id}-5556.{proxy}`); an explicit
/// `ws://`/`wss://` worker id is taken verbatim, which is how local dev
/// workers are addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoints {
    ws_url: String,
    control_base: Url,
}

impl WorkerEndpoints {
    pub fn for_worker(worker_id: &str, proxy_domain: &str) -> Result<Self, TransportError> {
        let trimmed = worker_id.trim();
        if trimmed.is_empty() {
            return Err(TransportError::InvalidWorker("empty worker id".into()));
        }

        if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
            let control_raw = if let Some(rest) = trimmed.strip_prefix("ws://") {
                format!("http://{rest}")
            } else {
                format!("https://{}", trimmed.trim_start_matches("wss://"))
            };
            let control_base = parse_base(&control_raw)?;
            return Ok(Self {
                ws_url: trimmed.to_string(),
                control_base,
            });
        }

        if trimmed.contains('/') || trimmed.contains(':') {
            return Err(TransportError::InvalidWorker(trimmed.to_string()));
        }
        let control_base = parse_base(&format!("https://{trimmed}-5556.{proxy_domain}"))?;
        Ok(Self {
            ws_url: format!("wss://{trimmed}-8766.{proxy_domain}"),
            control_base,
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn control_base(&self) -> &Url {
        &self.control_base
    }

    /// Prompt post target; the prompt text rides URL-encoded in the path.
    pub fn prompt_url(&self, slot: PromptSlot, text: &str) -> Result<Url, TransportError> {
        let segment = match slot {
            PromptSlot::One => "prompt",
            PromptSlot::Two => "second_prompt",
        };
        let encoded = urlencoding::encode(text);
        self.control_base
            .join(&format!("{segment}/{encoded}"))
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))
    }

    pub fn blend_url(&self, value: f64) -> Result<Url, TransportError> {
        self.control_base
            .join(&format!("blend/{value}"))
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))
    }
}

fn parse_base(raw: &str) -> Result<Url, TransportError> {
    let mut base = raw.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|err| TransportError::InvalidEndpoint(format!("{raw}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_worker_uses_proxy_scheme() {
        let endpoints = WorkerEndpoints::for_worker("abc123", "proxy.runpod.net").unwrap();
        assert_eq!(endpoints.ws_url(), "wss://abc123-8766.proxy.runpod.net");
        assert_eq!(
            endpoints.control_base().as_str(),
            "https://abc123-5556.proxy.runpod.net/"
        );
    }

    #[test]
    fn explicit_ws_worker_is_taken_verbatim() {
        let endpoints = WorkerEndpoints::for_worker("ws://127.0.0.1:9000", "unused").unwrap();
        assert_eq!(endpoints.ws_url(), "ws://127.0.0.1:9000");
        assert_eq!(endpoints.control_base().as_str(), "http://127.0.0.1:9000/");

        let tls = WorkerEndpoints::for_worker("wss://worker.example.com", "unused").unwrap();
        assert_eq!(tls.control_base().scheme(), "https");
    }

    #[test]
    fn rejects_empty_and_malformed_worker_ids() {
        assert!(WorkerEndpoints::for_worker("  ", "proxy").is_err());
        assert!(WorkerEndpoints::for_worker("host:9000", "proxy").is_err());
        assert!(WorkerEndpoints::for_worker("a/b", "proxy").is_err());
    }

    #[test]
    fn prompt_url_encodes_text_into_path() {
        let endpoints = WorkerEndpoints::for_worker("abc123", "proxy.runpod.net").unwrap();
        let url = endpoints
            .prompt_url(PromptSlot::One, "a painting of waves, rich blue")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc123-5556.proxy.runpod.net/prompt/a%20painting%20of%20waves%2C%20rich%20blue"
        );

        let second = endpoints.prompt_url(PromptSlot::Two, "x").unwrap();
        assert!(second.path().starts_with("/second_prompt/"));
    }

    #[test]
    fn blend_url_carries_numeric_value() {
        let endpoints = WorkerEndpoints::for_worker("abc123", "proxy.runpod.net").unwrap();
        let url = endpoints.blend_url(0.5).unwrap();
        assert_eq!(url.path(), "/blend/0.5");
    }
}
