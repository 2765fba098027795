//! `imgsync push` command - Upload an image graph from the CAS to a registry.

use std::path::{Path, PathBuf};

use clap::Args;
use imgsync_core::digest::Digest;
use imgsync_core::request::PushRequest;
use imgsync_runtime::PushEngine;

use super::{cancel_on_interrupt, GlobalArgs, Session};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Push request document (JSON)
    #[arg(required_unless_present = "from_cas", conflicts_with = "from_cas")]
    pub request: Option<PathBuf>,

    /// Read the push request from the CAS by digest instead of a file
    #[arg(long, value_name = "DIGEST")]
    pub from_cas: Option<String>,

    /// Size of the request blob named by --from-cas, if known
    #[arg(long, requires = "from_cas", default_value_t = -1, allow_negative_numbers = true)]
    pub size: i64,

    /// Upload workers (overrides push.workers)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, global: &GlobalArgs) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(global.config.as_deref())?;
    let mut push_config = session.config.push.clone();
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err("--workers must be at least 1".into());
        }
        push_config.workers = workers;
    }

    let engine = PushEngine::new(
        session.cas.clone(),
        session.transport.clone(),
        session.cache.clone(),
        &push_config,
    );
    let cancel = cancel_on_interrupt();

    let result = match (&args.request, &args.from_cas) {
        (Some(path), _) => {
            let request = load_request(path)?;
            if !args.quiet {
                println!(
                    "Pushing {} to {}...",
                    request.blobs[0].digest,
                    request.destination.repository()
                );
            }
            engine.commit(&request, &cancel).await
        }
        (None, Some(digest)) => {
            let digest = Digest::parse(digest, args.size)?;
            if !args.quiet {
                println!("Pushing request {}...", digest);
            }
            engine.commit_from_cas(&digest, &cancel).await
        }
        (None, None) => return Err("a request file or --from-cas is required".into()),
    };
    engine.shutdown().await;
    result?;

    if !args.quiet {
        println!("Pushed");
    }
    Ok(())
}

/// Read a push request file.
pub fn load_request(path: &Path) -> Result<PushRequest, Box<dyn std::error::Error>> {
    let data = std::fs::read(path)
        .map_err(|e| format!("Failed to read push request {}: {}", path.display(), e))?;
    Ok(PushRequest::from_slice(&data)?)
}
