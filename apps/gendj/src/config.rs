use std::time::Duration;

/// GenDJ engine configuration. The CLI layer fills the endpoint fields from
/// flags and environment; cadence and pacing carry the engine contract.
#[derive(Debug, Clone)]
pub struct Config {
    /// Warp API base (defaults to the hosted service).
    pub api_base: String,
    /// Bearer token attached to every warp API call.
    pub api_token: Option<String>,
    /// Domain the worker proxy endpoints hang off of.
    pub proxy_domain: String,
    pub cadence: Cadence,
    pub blend: BlendPacing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "https://api.gendj.com".to_string(),
            api_token: None,
            proxy_domain: "proxy.runpod.net".to_string(),
            cadence: Cadence::default(),
            blend: BlendPacing::default(),
        }
    }
}

/// Timing knobs for the session lifecycle and the stream supervisor.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    /// Queue poll spacing while the warp waits for a worker.
    pub poll_interval: Duration,
    /// Heartbeat spacing while the warp is running.
    pub heartbeat_interval: Duration,
    /// Grace period before the first connect to a cold-started worker.
    pub warmup_delay: Duration,
    /// Blank frames pushed right after a cold-start connect to prime the
    /// remote pipeline.
    pub warmup_frame_count: usize,
    /// Pause before re-dialing after an unexpected channel close.
    pub reconnect_backoff: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(7),
            heartbeat_interval: Duration::from_secs(30),
            warmup_delay: Duration::from_secs(3),
            warmup_frame_count: 5,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Client-side pacing of blend control posts.
#[derive(Debug, Clone, Copy)]
pub struct BlendPacing {
    /// Minimum spacing between two posts.
    pub min_interval: Duration,
    /// How long after the last post a coalesced trailing value is flushed.
    pub trailing_flush: Duration,
}

impl Default for BlendPacing {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(24),
            trailing_flush: Duration::from_millis(60),
        }
    }
}
