//! Cross-session diagnostics. Sessions push state transitions in; readers
//! get a point-in-time copy, never the live structures.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use argus_core::ResourceFilter;
use chrono::{DateTime, Utc};

use crate::session::SessionPhase;

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub filter: ResourceFilter,
    pub phase: SessionPhase,
    pub reconnects: u32,
    pub consecutive_failures: u32,
    pub connection_healthy: bool,
    pub tracked_objects: usize,
    pub hard_resets: u32,
    pub started_at: DateTime<Utc>,
    pub last_successful_watch_at: Option<DateTime<Utc>>,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionStats>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str, filter: ResourceFilter) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            key.to_string(),
            SessionStats {
                filter,
                phase: SessionPhase::LoadingSnapshot,
                reconnects: 0,
                consecutive_failures: 0,
                connection_healthy: false,
                tracked_objects: 0,
                hard_resets: 0,
                started_at: Utc::now(),
                last_successful_watch_at: None,
                last_delivery_at: None,
            },
        );
    }

    pub fn update(&self, key: &str, apply: impl FnOnce(&mut SessionStats)) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(stats) = map.get_mut(key) {
            apply(stats);
        }
    }

    /// Point-in-time copy for diagnostics.
    pub fn snapshot(&self) -> HashMap<String, SessionStats> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase_of(&self, key: &str) -> Option<SessionPhase> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|s| s.phase)
    }
}
