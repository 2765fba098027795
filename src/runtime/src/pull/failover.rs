//! Trying candidate sources one after another.

use std::future::Future;

use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::Repository;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

/// Errors that end a manifest lookup at once. A digest-pinned manifest that
/// does not hash to its digest is an integrity failure of the request itself.
pub fn is_fatal(err: &SyncError) -> bool {
    matches!(err, SyncError::Integrity { .. }) || is_fatal_for_blob(err)
}

/// Errors that end a blob fetch at once. A mirror serving corrupt bytes is
/// skipped like any other failing mirror.
pub fn is_fatal_for_blob(err: &SyncError) -> bool {
    matches!(err, SyncError::Cancelled(_) | SyncError::Airgapped(_))
}

/// `sources` in random order, spreading blob traffic across mirrors.
pub fn shuffled(sources: &[Repository]) -> Vec<Repository> {
    let mut order = sources.to_vec();
    order.shuffle(&mut rand::thread_rng());
    order
}

/// Run `attempt` against each source in order until one succeeds.
///
/// Every failed attempt is logged. Returns the winning source with its value,
/// the first error [`is_fatal`] accepts, or `SourcesExhausted` naming the last
/// source tried.
pub async fn first_success<T, F, Fut>(
    what: &str,
    sources: &[Repository],
    cancel: &CancellationToken,
    attempt: F,
) -> Result<(Repository, T)>
where
    F: FnMut(Repository) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    try_sources(what, sources, cancel, is_fatal, attempt).await
}

/// [`first_success`] for blob fetches: integrity failures move on to the
/// next source.
pub async fn first_blob_success<T, F, Fut>(
    what: &str,
    sources: &[Repository],
    cancel: &CancellationToken,
    attempt: F,
) -> Result<(Repository, T)>
where
    F: FnMut(Repository) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    try_sources(what, sources, cancel, is_fatal_for_blob, attempt).await
}

async fn try_sources<T, F, Fut>(
    what: &str,
    sources: &[Repository],
    cancel: &CancellationToken,
    fatal: fn(&SyncError) -> bool,
    mut attempt: F,
) -> Result<(Repository, T)>
where
    F: FnMut(Repository) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<(&Repository, SyncError)> = None;

    for (i, source) in sources.iter().enumerate() {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled(format!("fetching {}", what))),
            r = attempt(source.clone()) => r,
        };

        match result {
            Ok(value) => {
                tracing::debug!(what, source = %source, attempt = i + 1, "Fetched");
                return Ok((source.clone(), value));
            }
            Err(e) if fatal(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    what,
                    source = %source,
                    attempt = i + 1,
                    of = sources.len(),
                    error = %e,
                    "Source failed"
                );
                last = Some((source, e));
            }
        }
    }

    Err(match last {
        Some((source, error)) => SyncError::SourcesExhausted {
            what: what.to_string(),
            attempts: sources.len(),
            last_source: source.to_string(),
            last_error: error.to_string(),
        },
        None => SyncError::SourcesExhausted {
            what: what.to_string(),
            attempts: 0,
            last_source: "<none>".to_string(),
            last_error: "no sources given".to_string(),
        },
    })
}
