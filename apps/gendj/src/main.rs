use clap::Parser;

use gendj_client_core::app::{self, AppOptions};
use gendj_client_core::cli::{Cli, CliError};
use gendj_client_core::config::Config;
use gendj_client_core::frame::Stride;
use gendj_client_core::telemetry::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&cli.logging.to_config())?;

    let config = Config {
        api_base: cli.api_base,
        api_token: cli.api_token,
        proxy_domain: cli.proxy_domain,
        ..Config::default()
    };
    let stride = cli
        .drop_frame
        .as_deref()
        .map(str::parse::<Stride>)
        .transpose()?;

    let options = AppOptions {
        frames_dir: cli.frames_dir,
        local_worker: cli.local_worker,
        stride,
        preview: cli.preview,
        paused: cli.paused,
        midi: cli.midi,
    };
    app::run(config, options).await
}
