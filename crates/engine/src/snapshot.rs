//! Paged baseline loading with bounded whole-load retry. A session must not
//! open its watch before this succeeds; that gap-free handoff is what makes
//! the event stream trustworthy.

use std::time::Duration;

use argus_core::{LiteMeta, WatchTuning};
use metrics::counter;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::Backoff;
use crate::source::WatchSource;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The bounded retry budget ran out. Fatal for the session, never for
    /// the process.
    #[error("listing retries exhausted: {0}")]
    Exhausted(String),
    #[error("cancelled")]
    Cancelled,
}

/// A complete baseline: every matching object plus the version to watch from.
#[derive(Debug)]
pub struct Snapshot {
    pub items: Vec<LiteMeta>,
    pub resource_version: String,
}

/// Page through the full listing. Any page failure restarts the whole load
/// under an exponential policy; each page also carries its own short
/// timeout so a wedged request cannot stall the retry clock.
pub async fn load_snapshot(
    source: &dyn WatchSource,
    tuning: &WatchTuning,
    cancel: &CancellationToken,
) -> Result<Snapshot, SnapshotError> {
    let mut retry = Backoff::bounded(RETRY_BASE, RETRY_CAP, tuning.snapshot_retry_steps);
    loop {
        match attempt(source, tuning, cancel).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(AttemptError::Cancelled) => return Err(SnapshotError::Cancelled),
            Err(AttemptError::Page(reason)) => {
                let Some(delay) = retry.next_delay() else {
                    return Err(SnapshotError::Exhausted(reason));
                };
                counter!("argus_snapshot_retries_total", 1u64);
                warn!(%reason, delay_ms = delay.as_millis() as u64, "listing failed, retrying from the first page");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SnapshotError::Cancelled),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

enum AttemptError {
    Page(String),
    Cancelled,
}

async fn attempt(
    source: &dyn WatchSource,
    tuning: &WatchTuning,
    cancel: &CancellationToken,
) -> Result<Snapshot, AttemptError> {
    let mut items = Vec::new();
    let mut resource_version = String::new();
    let mut list_version: Option<String> = None;
    let mut token: Option<String> = None;
    loop {
        let page = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            fetched = timeout(
                tuning.page_timeout(),
                source.fetch_page(tuning.page_limit, token.as_deref()),
            ) => match fetched {
                Ok(Ok(page)) => page,
                Ok(Err(err)) => return Err(AttemptError::Page(err.to_string())),
                Err(_) => return Err(AttemptError::Page("page fetch timed out".into())),
            }
        };
        for item in page.items {
            if !item.resource_version.is_empty() {
                resource_version = item.resource_version.clone();
            }
            items.push(item);
        }
        if page.resource_version.is_some() {
            list_version = page.resource_version;
        }
        match page.continue_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    if resource_version.is_empty() {
        // empty result set: fall back to the list-level version, or let the
        // server pick its current point
        resource_version = list_version.unwrap_or_default();
    }
    Ok(Snapshot {
        items,
        resource_version,
    })
}
