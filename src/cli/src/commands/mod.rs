//! CLI command definitions and dispatch.

mod download_blob;
mod login;
mod logout;
mod pull;
mod push;
mod sync_ref_graph;
mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use imgsync_core::config::SyncConfig;
use imgsync_core::request::Repository;
use imgsync_runtime::{DiskCas, OciTransport, SmallBlobCache};
use tokio_util::sync::CancellationToken;

pub use download_blob::DownloadBlobArgs;
pub use login::LoginArgs;
pub use logout::LogoutArgs;
pub use pull::{build_request, PullArgs};
pub use push::{load_request, PushArgs};
pub use sync_ref_graph::SyncRefGraphArgs;
pub use version::VersionArgs;

/// imgsync - move OCI images between a local content store and registries.
#[derive(Parser)]
#[command(name = "imgsync", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags accepted by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload an image graph from the local CAS to a registry
    Push(PushArgs),
    /// Resolve an image from registries into the local CAS
    Pull(PullArgs),
    /// Fetch a single blob by digest
    DownloadBlob(DownloadBlobArgs),
    /// Build reference-graph facts for a set of images
    SyncRefGraph(SyncRefGraphArgs),
    /// Store registry credentials
    Login(LoginArgs),
    /// Remove stored registry credentials
    Logout(LogoutArgs),
    /// Show version information
    Version(VersionArgs),
}

/// Dispatch a parsed CLI command.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let global = cli.global;
    match cli.command {
        Command::Push(args) => push::execute(args, &global).await,
        Command::Pull(args) => pull::execute(args, &global).await,
        Command::DownloadBlob(args) => download_blob::execute(args, &global).await,
        Command::SyncRefGraph(args) => sync_ref_graph::execute(args, &global).await,
        Command::Login(args) => login::execute(args).await,
        Command::Logout(args) => logout::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

/// Configuration, local store and registry client shared by the engine commands.
pub struct Session {
    pub config: SyncConfig,
    pub cas: Arc<DiskCas>,
    pub cache: Arc<SmallBlobCache>,
    pub transport: Arc<OciTransport>,
}

impl Session {
    /// Resolve configuration and open the CAS it names.
    pub fn open(config: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let config = SyncConfig::resolve(config)?;
        let cas = Arc::new(DiskCas::open(&config.cas_dir)?);
        let cache = Arc::new(SmallBlobCache::new(config.small_cache_limit));
        let transport = Arc::new(OciTransport::new(&config.insecure_registries));
        tracing::debug!(cas = %config.cas_dir.display(), "Opened session");
        Ok(Self {
            config,
            cas,
            cache,
            transport,
        })
    }
}

/// Parse `repository@registry` source flags.
pub fn parse_sources(sources: &[String]) -> Result<Vec<Repository>, Box<dyn std::error::Error>> {
    Ok(sources
        .iter()
        .map(|s| Repository::parse_source(s))
        .collect::<Result<Vec<_>, _>>()?)
}

/// A token cancelled on Ctrl-C.
pub fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}
