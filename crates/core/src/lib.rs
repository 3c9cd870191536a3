//! Argus core types: resource filters, watch events, and engine tunables.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Map key for tracked objects: `namespace + "/" + name`.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// One watched resource collection: kind plus optional namespace scope and
/// optional exact object name. Empty strings widen the scope ("" namespace
/// means all namespaces, "" name means all objects of the kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceFilter {
    /// Kubernetes kind, e.g. "Deployment". Validated as non-empty by the
    /// config layer rather than at parse time.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, rename = "resourceName")]
    pub resource_name: String,
}

impl ResourceFilter {
    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    pub fn name_opt(&self) -> Option<&str> {
        if self.resource_name.is_empty() { None } else { Some(&self.resource_name) }
    }

    /// Stable key identifying this filter's session in logs and the registry.
    pub fn session_key(&self) -> String {
        let ns = if self.namespace.is_empty() { "*" } else { &self.namespace };
        if self.resource_name.is_empty() {
            format!("{}/{}", self.kind, ns)
        } else {
            format!("{}/{}/{}", self.kind, ns, self.resource_name)
        }
    }
}

/// Wire-level event type as delivered by the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Shaped object metadata extracted from a raw watch payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiteMeta {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub creation_ts: Option<DateTime<Utc>>,
    /// Best-effort "who changed this" from annotations/labels; "unknown" if absent.
    pub actor: String,
}

impl LiteMeta {
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// A single raw watch delivery, decoupled from the client library so the
/// classifier and the session loop can be driven by scripted streams.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Added(LiteMeta),
    Modified(LiteMeta),
    Deleted(LiteMeta),
    /// Advances the checkpoint without an object change.
    Bookmark { resource_version: String },
    /// Out-of-band status object reporting a stream failure.
    Failed { message: String, code: u16 },
}

/// Canonical change notification handed to the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub actor: String,
    #[serde(rename = "observedAt")]
    pub observed_at: DateTime<Utc>,
    #[serde(rename = "resourceVersion")]
    pub resource_version: String,
}

/// Per-session engine tunables. Every field has a sensible default so a
/// config file only needs to spell out what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchTuning {
    /// Server-side watch connection timeout. Clamped to 290s at request
    /// build time; the API rejects anything >= 295s.
    pub watch_timeout_secs: u32,
    /// Unbroken reconnect failures tolerated before a forced hard reset.
    pub max_reconnects: u32,
    /// Linear backoff step between ordinary stream reconnects.
    pub reconnect_backoff_ms: u64,
    /// Heartbeat watchdog cadence; a connection is stale after 3 misses.
    pub heartbeat_interval_ms: u64,
    /// Request watch bookmarks so the checkpoint advances while idle.
    pub keep_alive: bool,
    /// Sliding window for suppressing repeated identical deliveries.
    pub dedup_window_secs: u64,
    /// List page size for snapshot loading.
    pub page_limit: u32,
    /// Catch-up window after watch start during which snapshot-era noise is
    /// suppressed; also the clock-skew allowance for "genuinely new".
    pub startup_grace_secs: u64,
    /// Quiet period between snapshot completion and the first watch open.
    pub startup_delay_secs: u64,
    /// Tracked snapshot entries untouched this long are evicted.
    pub snapshot_ttl_hours: u64,
    /// How many sessions may load snapshots concurrently at startup.
    pub list_concurrency: usize,
    /// How long a session waits for admission before it is abandoned.
    pub startup_deadline_secs: u64,
    /// Bounded retry budget for the initial listing.
    pub snapshot_retry_steps: u32,
    /// Timeout for a single snapshot page fetch.
    pub page_timeout_secs: u64,
}

impl Default for WatchTuning {
    fn default() -> Self {
        Self {
            watch_timeout_secs: 300,
            max_reconnects: 5,
            reconnect_backoff_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            keep_alive: true,
            dedup_window_secs: 3_600,
            page_limit: 500,
            startup_grace_secs: 30,
            startup_delay_secs: 10,
            snapshot_ttl_hours: 24,
            list_concurrency: 2,
            startup_deadline_secs: 300,
            snapshot_retry_steps: 10,
            page_timeout_secs: 30,
        }
    }
}

impl WatchTuning {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_hours * 3600)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }
}
