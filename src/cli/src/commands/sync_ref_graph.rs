//! `imgsync sync-ref-graph` command - Build ref-graph facts for a set of images.

use std::path::PathBuf;

use clap::Args;
use imgsync_core::refgraph::{load_images, Facts};
use imgsync_runtime::refgraph::DEFAULT_REFGRAPH_WORKERS;
use imgsync_runtime::RefGraphSyncer;

use super::{cancel_on_interrupt, GlobalArgs, Session};

#[derive(Args, Debug)]
pub struct SyncRefGraphArgs {
    /// Images document: digest -> {repository, registries, sources, ...}
    #[arg(long)]
    pub images: PathBuf,

    /// Facts from a previous run; known digests are not downloaded again
    #[arg(long)]
    pub facts: Option<PathBuf>,

    /// Where to write the resulting facts
    #[arg(short, long)]
    pub output: PathBuf,

    /// Concurrent manifest downloads
    #[arg(long, default_value_t = DEFAULT_REFGRAPH_WORKERS)]
    pub workers: usize,
}

pub async fn execute(
    args: SyncRefGraphArgs,
    global: &GlobalArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(global.config.as_deref())?;
    let images = load_images(&args.images)?;
    let cached = match &args.facts {
        Some(path) => Facts::load(path)?,
        None => Facts::new(),
    };
    tracing::info!(images = images.len(), cached = cached.len(), "Syncing ref graph");

    let facts = RefGraphSyncer::new(session.transport.clone())
        .with_workers(args.workers)
        .sync(&images, &cached, &cancel_on_interrupt())
        .await?;
    facts.save(&args.output)?;

    println!("Wrote {} facts to {}", facts.len(), args.output.display());
    Ok(())
}
