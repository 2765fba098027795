//! imgsync CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use imgsync_cli::commands::{dispatch, Cli, LogFormat};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.global.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match cli.global.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
