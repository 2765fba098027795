//! `imgsync download-blob` command - Fetch one blob by digest.

use std::path::{Path, PathBuf};

use clap::Args;
use imgsync_core::digest::Digest;
use imgsync_runtime::PullEngine;

use super::{cancel_on_interrupt, parse_sources, GlobalArgs, Session};

#[derive(Args, Debug)]
pub struct DownloadBlobArgs {
    /// Blob digest (sha256:...)
    pub digest: String,

    /// Mirror holding the blob, as repository@registry (repeatable)
    #[arg(long = "source", value_name = "REPOSITORY@REGISTRY", required = true)]
    pub sources: Vec<String>,

    /// Expected blob size in bytes
    #[arg(long)]
    pub size: Option<i64>,

    /// Copy the blob here once it is in the CAS
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Mark the output file executable
    #[arg(long, requires = "output")]
    pub executable: bool,

    /// Serve from the local CAS only
    #[arg(long)]
    pub airgapped: bool,
}

pub async fn execute(
    args: DownloadBlobArgs,
    global: &GlobalArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(global.config.as_deref())?;
    let digest = Digest::parse(&args.digest, args.size.unwrap_or(-1))?;
    let sources = parse_sources(&args.sources)?;

    let engine = PullEngine::new(session.cas.clone(), session.transport.clone(), session.cache.clone());
    engine
        .download_blob(&sources, &digest, args.airgapped, &cancel_on_interrupt())
        .await?;

    let stored = session.cas.blob_path(&digest);
    match &args.output {
        Some(output) => {
            copy_out(&stored, output, args.executable)?;
            println!("{}", output.display());
        }
        None => println!("{}", stored.display()),
    }
    Ok(())
}

fn copy_out(stored: &Path, output: &Path, executable: bool) -> std::io::Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::copy(stored, output)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(output, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = executable;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_out_creates_parents() {
        let dir = TempDir::new().unwrap();
        let stored = dir.path().join("blob");
        std::fs::write(&stored, b"#!/bin/sh\n").unwrap();
        let output = dir.path().join("bin").join("tool");

        copy_out(&stored, &output, true).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"#!/bin/sh\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&output).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
