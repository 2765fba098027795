//! `imgsync logout` command - Remove stored registry credentials.

use clap::Args;
use imgsync_core::request::DEFAULT_REGISTRY;
use imgsync_runtime::CredentialStore;

#[derive(Args, Debug)]
pub struct LogoutArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,
}

pub async fn execute(args: LogoutArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());

    if CredentialStore::default_path().remove(&server)? {
        println!("Removing login credentials for {}", server);
    } else {
        println!("Not logged in to {}", server);
    }

    Ok(())
}
