use clap::{Args, Parser};
use std::path::PathBuf;
use thiserror::Error;

use crate::frame::StrideError;
use crate::midi::mapping::MappingError;
use crate::session::SessionError;
use crate::telemetry::logging::{InitError, LogConfig, LogLevel};
use crate::transport::control::ControlError;
use crate::transport::TransportError;

#[derive(Parser, Debug)]
#[command(
    name = "gendj",
    about = "🎛  Stream video through a remote AI warp worker, live",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "GENDJ_API_BASE",
        default_value = "https://api.gendj.com",
        help = "Base URL for the warp session API"
    )]
    pub api_base: String,

    #[arg(
        long,
        env = "GENDJ_API_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with every warp API call"
    )]
    pub api_token: Option<String>,

    #[arg(
        long,
        env = "GENDJ_WORKER_PROXY_DOMAIN",
        default_value = "proxy.runpod.net",
        help = "Domain the per-worker proxy endpoints are built on"
    )]
    pub proxy_domain: String,

    #[arg(
        long,
        value_name = "WORKER",
        help = "Attach directly to a worker (id or ws:// url) instead of creating a session"
    )]
    pub local_worker: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Stream a directory of images as the capture source"
    )]
    pub frames_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "STRIDE",
        help = "Drop every nth outbound frame: none, 2, 3, 4 or 5 (persisted as the new preference)"
    )]
    pub drop_frame: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Write the most recent warped frame to PATH as PNG"
    )]
    pub preview: Option<PathBuf>,

    #[arg(long, help = "Start with outbound streaming paused")]
    pub paused: bool,

    #[arg(long, help = "Listen to connected MIDI controllers")]
    pub midi: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "GENDJ_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "GENDJ_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("control channel error: {0}")]
    Control(#[from] ControlError),
    #[error("capture source error: {0}")]
    Source(#[from] crate::frame::source::SourceError),
    #[error("state store error: {0}")]
    Store(#[from] MappingError),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<StrideError> for CliError {
    fn from(err: StrideError) -> Self {
        CliError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_target_the_hosted_service() {
        let cli = Cli::parse_from(["gendj"]);
        assert_eq!(cli.api_base, "https://api.gendj.com");
        assert_eq!(cli.proxy_domain, "proxy.runpod.net");
        assert!(!cli.paused);
        assert!(cli.local_worker.is_none());
    }

    #[test]
    fn parses_stream_flags() {
        let cli = Cli::parse_from([
            "gendj",
            "--local-worker",
            "ws://127.0.0.1:9000",
            "--drop-frame",
            "3",
            "--paused",
        ]);
        assert_eq!(cli.local_worker.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(cli.drop_frame.as_deref(), Some("3"));
        assert!(cli.paused);
    }
}
