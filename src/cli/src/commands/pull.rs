//! `imgsync pull` command.

use std::path::PathBuf;

use clap::Args;
use imgsync_core::config::SyncConfig;
use imgsync_core::refgraph::Facts;
use imgsync_core::request::{LayerHandling, PullReference, PullRequest};
use imgsync_runtime::{ImageName, PullEngine, PullOutcome};

use super::{cancel_on_interrupt, parse_sources, GlobalArgs, Session};

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image name (e.g., "alpine:3.19", "ghcr.io/org/app@sha256:...")
    #[arg(required_unless_present = "request", conflicts_with = "request")]
    pub image: Option<String>,

    /// Pull request document (JSON) instead of an image name
    #[arg(long)]
    pub request: Option<PathBuf>,

    /// Mirror to try, as repository@registry (repeatable, tried in order)
    #[arg(long = "source", value_name = "REPOSITORY@REGISTRY")]
    pub sources: Vec<String>,

    /// Download layer bodies too
    #[arg(long)]
    pub eager: bool,

    /// Serve everything from the local CAS, never the network
    #[arg(long)]
    pub airgapped: bool,

    /// Concurrent downloads (overrides pull.concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Merge the resolved ref-graph entries into this facts file
    #[arg(long, value_name = "PATH")]
    pub facts_out: Option<PathBuf>,

    /// Print only the root digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, global: &GlobalArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(global.config.as_deref())?;
    let request = build_request(&args, &session.config)?;

    let engine = PullEngine::new(session.cas.clone(), session.transport.clone(), session.cache.clone());
    let outcome = engine.pull(&request, &cancel_on_interrupt()).await?;

    if let Some(path) = &args.facts_out {
        let mut facts = Facts::load(path)?;
        for (digest, entry) in &outcome.graph {
            facts.insert(digest.clone(), entry.clone());
        }
        facts.save(path)?;
        tracing::debug!(path = %path.display(), facts = facts.len(), "Wrote facts");
    }

    if args.quiet {
        println!("{}", outcome.digest);
    } else {
        println!("{}", serde_json::to_string_pretty(&summary(&outcome))?);
    }
    Ok(())
}

/// Turn command-line arguments into a pull request.
///
/// A request file is taken as written, with flags given on the command line
/// layered on top. An image name supplies the source when no `--source` is
/// given and defaults to the `latest` tag.
pub fn build_request(
    args: &PullArgs,
    config: &SyncConfig,
) -> Result<PullRequest, Box<dyn std::error::Error>> {
    let mut request = match (&args.request, &args.image) {
        (Some(path), _) => {
            let data = std::fs::read(path)
                .map_err(|e| format!("Failed to read pull request {}: {}", path.display(), e))?;
            PullRequest::from_slice(&data)?
        }
        (None, Some(image)) => {
            let name = ImageName::parse(image)?;
            let reference = name
                .reference
                .unwrap_or_else(|| PullReference::Tag("latest".to_string()));
            let mut request = PullRequest::new(vec![name.source], reference.as_str());
            request.layer_handling = config.pull.layer_handling;
            request.concurrency = config.pull.concurrency;
            request
        }
        (None, None) => return Err("an image name or --request is required".into()),
    };

    if !args.sources.is_empty() {
        request.sources = parse_sources(&args.sources)?;
    }
    if args.eager {
        request.layer_handling = LayerHandling::Eager;
    }
    if args.airgapped {
        request.airgapped = true;
    }
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            return Err("--concurrency must be at least 1".into());
        }
        request.concurrency = concurrency;
    }
    Ok(request)
}

fn summary(outcome: &PullOutcome) -> serde_json::Value {
    serde_json::json!({
        "digest": outcome.digest,
        "kind": outcome.kind.to_string(),
        "source": outcome.source.to_string(),
        "reproducible": outcome.reproducible,
        "stored": outcome.stored.iter().map(|d| d.digest.as_str()).collect::<Vec<_>>(),
        "graph": outcome.graph.keys().collect::<Vec<_>>(),
    })
}
