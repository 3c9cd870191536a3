//! Event classification: startup-echo suppression, catch-up gating,
//! duplicate-delivery suppression and checkpoint bookkeeping. Owned by
//! exactly one session task; nothing here is shared.

use std::time::Duration;

use argus_core::{ChangeEvent, EventType, LiteMeta, RawEvent, ResourceFilter, WatchTuning};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// What the session should do with one raw event.
#[derive(Debug)]
pub enum Outcome {
    Deliver(ChangeEvent),
    /// Nothing to forward; the reason feeds the skip counter.
    Suppressed(&'static str),
    /// Checkpoint advanced, nothing else to do.
    Advanced,
    /// In-band failure: the stream must be torn down and reopened.
    Fail { message: String, code: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    event_type: EventType,
    kind: String,
    namespace: String,
    name: String,
    resource_version: String,
    generation: u64,
}

#[derive(Debug)]
struct TrackedEntry {
    resource_version: String,
    last_seen: Instant,
}

pub struct Classifier {
    filter: ResourceFilter,
    grace: Duration,
    dedup_window: Duration,
    snapshot_ttl: Duration,
    resource_version: String,
    tracked: FxHashMap<String, TrackedEntry>,
    dedup: FxHashMap<DedupKey, Instant>,
    /// Bumped on every hard reset so a legitimately re-delivered event in
    /// the rebuilt world is not swallowed by the old window.
    generation: u64,
    watch_started: Option<Instant>,
    watch_started_wall: Option<DateTime<Utc>>,
}

impl Classifier {
    pub fn new(filter: ResourceFilter, tuning: &WatchTuning) -> Self {
        Self {
            filter,
            grace: tuning.startup_grace(),
            dedup_window: tuning.dedup_window(),
            snapshot_ttl: tuning.snapshot_ttl(),
            resource_version: String::new(),
            tracked: FxHashMap::default(),
            dedup: FxHashMap::default(),
            generation: 0,
            watch_started: None,
            watch_started_wall: None,
        }
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Install a fresh baseline from a completed listing.
    pub fn install_snapshot(&mut self, resource_version: String, items: Vec<LiteMeta>) {
        let now = Instant::now();
        self.tracked.clear();
        for item in items {
            self.tracked.insert(
                item.key(),
                TrackedEntry {
                    resource_version: item.resource_version,
                    last_seen: now,
                },
            );
        }
        self.resource_version = resource_version;
        self.watch_started = None;
        self.watch_started_wall = None;
    }

    /// Anchor the catch-up window at the first watch open after a snapshot.
    /// Ordinary reconnects keep the original anchor, otherwise real edits
    /// arriving after every stream recycle would be swallowed as catch-up.
    pub fn mark_watch_started(&mut self) {
        if self.watch_started.is_none() {
            self.watch_started = Some(Instant::now());
            self.watch_started_wall = Some(Utc::now());
        }
    }

    /// Discard checkpoint, baseline and dedup state after the server refused
    /// the resume point.
    pub fn hard_reset(&mut self) {
        self.tracked.clear();
        self.dedup.clear();
        self.resource_version.clear();
        self.generation += 1;
        self.watch_started = None;
        self.watch_started_wall = None;
    }

    pub fn classify(&mut self, event: RawEvent) -> Outcome {
        match event {
            RawEvent::Failed { message, code } => Outcome::Fail { message, code },
            RawEvent::Bookmark { resource_version } => {
                if !resource_version.is_empty() {
                    self.resource_version = resource_version;
                }
                Outcome::Advanced
            }
            RawEvent::Added(meta) => self.classify_object(EventType::Added, meta),
            RawEvent::Modified(meta) => self.classify_object(EventType::Modified, meta),
            RawEvent::Deleted(meta) => self.classify_object(EventType::Deleted, meta),
        }
    }

    fn classify_object(&mut self, event_type: EventType, meta: LiteMeta) -> Outcome {
        if let Some(expected) = self.filter.name_opt() {
            if meta.name != expected {
                return Outcome::Suppressed("name-mismatch");
            }
        }
        if !meta.resource_version.is_empty() {
            self.resource_version = meta.resource_version.clone();
        }
        let key = meta.key();
        let now = Instant::now();
        match event_type {
            EventType::Added => {
                if let Some(entry) = self.tracked.get_mut(&key) {
                    // The listing already captured this object; the watch is
                    // replaying it. Refresh liveness only.
                    entry.last_seen = now;
                    return Outcome::Suppressed("startup-echo");
                }
                let genuinely_new = match meta.creation_ts {
                    Some(created) => {
                        let started = self.watch_started_wall.unwrap_or_else(Utc::now);
                        let skew = chrono::Duration::seconds(self.grace.as_secs() as i64);
                        created > started - skew
                    }
                    None => self.grace_elapsed(now),
                };
                self.tracked.insert(
                    key,
                    TrackedEntry {
                        resource_version: meta.resource_version.clone(),
                        last_seen: now,
                    },
                );
                if !genuinely_new {
                    // Pre-existing object the listing missed; remember it
                    // without announcing it.
                    return Outcome::Suppressed("snapshot-era");
                }
                self.gate_and_build(event_type, meta, now)
            }
            EventType::Modified => {
                let changed = match self.tracked.get(&key) {
                    Some(entry) => entry.resource_version != meta.resource_version,
                    None => true,
                };
                self.tracked.insert(
                    key,
                    TrackedEntry {
                        resource_version: meta.resource_version.clone(),
                        last_seen: now,
                    },
                );
                if !self.grace_elapsed(now) {
                    return Outcome::Suppressed("catch-up");
                }
                if !changed {
                    return Outcome::Suppressed("same-version");
                }
                self.gate_and_build(event_type, meta, now)
            }
            EventType::Deleted => {
                self.tracked.remove(&key);
                if !self.grace_elapsed(now) {
                    return Outcome::Suppressed("catch-up");
                }
                self.gate_and_build(event_type, meta, now)
            }
        }
    }

    fn grace_elapsed(&self, now: Instant) -> bool {
        match self.watch_started {
            Some(started) => now.duration_since(started) > self.grace,
            None => false,
        }
    }

    fn gate_and_build(&mut self, event_type: EventType, meta: LiteMeta, now: Instant) -> Outcome {
        let dedup_key = DedupKey {
            event_type,
            kind: self.filter.kind.clone(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            resource_version: meta.resource_version.clone(),
            generation: self.generation,
        };
        if let Some(seen) = self.dedup.get(&dedup_key) {
            if now.duration_since(*seen) < self.dedup_window {
                return Outcome::Suppressed("duplicate");
            }
        }
        self.dedup.insert(dedup_key, now);
        Outcome::Deliver(ChangeEvent {
            event_type,
            kind: self.filter.kind.clone(),
            namespace: meta.namespace,
            name: meta.name,
            actor: meta.actor,
            observed_at: Utc::now(),
            resource_version: meta.resource_version,
        })
    }

    /// Drop baseline entries not refreshed within the TTL. Their next edit
    /// will classify as new again; accepted bound on memory.
    pub fn evict_stale_tracked(&mut self) -> usize {
        let before = self.tracked.len();
        let now = Instant::now();
        let ttl = self.snapshot_ttl;
        self.tracked
            .retain(|_, entry| now.duration_since(entry.last_seen) <= ttl);
        before - self.tracked.len()
    }

    pub fn evict_expired_dedup(&mut self) -> usize {
        let before = self.dedup.len();
        let now = Instant::now();
        let window = self.dedup_window;
        self.dedup
            .retain(|_, seen| now.duration_since(*seen) <= window);
        before - self.dedup.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn filter(kind: &str, ns: &str, name: &str) -> ResourceFilter {
        ResourceFilter {
            kind: kind.into(),
            namespace: ns.into(),
            resource_name: name.into(),
        }
    }

    fn meta(ns: &str, name: &str, rv: &str) -> LiteMeta {
        LiteMeta {
            namespace: ns.into(),
            name: name.into(),
            resource_version: rv.into(),
            creation_ts: None,
            actor: "unknown".into(),
        }
    }

    fn classifier_with(items: Vec<LiteMeta>) -> Classifier {
        let mut c = Classifier::new(filter("ConfigMap", "ns", ""), &WatchTuning::default());
        c.install_snapshot("10".into(), items);
        c.mark_watch_started();
        c
    }

    fn assert_delivers(outcome: Outcome, event_type: EventType, name: &str) -> ChangeEvent {
        match outcome {
            Outcome::Deliver(ev) => {
                assert_eq!(ev.event_type, event_type);
                assert_eq!(ev.name, name);
                ev
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    fn assert_suppressed(outcome: Outcome, reason: &str) {
        match outcome {
            Outcome::Suppressed(r) => assert_eq!(r, reason),
            other => panic!("expected suppression {reason}, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_echo_never_notifies() {
        let mut c = classifier_with(vec![meta("ns", "a", "1")]);
        assert_suppressed(
            c.classify(RawEvent::Added(meta("ns", "a", "1"))),
            "startup-echo",
        );
        // still an echo well after the grace period
        advance(Duration::from_secs(120)).await;
        assert_suppressed(
            c.classify(RawEvent::Added(meta("ns", "a", "1"))),
            "startup-echo",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn added_with_recent_creation_notifies() {
        let mut c = classifier_with(vec![]);
        let mut m = meta("ns", "fresh", "7");
        m.creation_ts = Some(Utc::now());
        assert_delivers(c.classify(RawEvent::Added(m)), EventType::Added, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn added_with_old_creation_is_recorded_quietly() {
        let mut c = classifier_with(vec![]);
        advance(Duration::from_secs(120)).await;
        let mut m = meta("ns", "relic", "7");
        m.creation_ts = Some(Utc::now() - chrono::Duration::hours(2));
        assert_suppressed(c.classify(RawEvent::Added(m)), "snapshot-era");
        assert_eq!(c.tracked_len(), 1);
        // a later edit to the now-tracked object announces normally
        assert_delivers(
            c.classify(RawEvent::Modified(meta("ns", "relic", "8"))),
            EventType::Modified,
            "relic",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn added_without_creation_time_waits_out_the_grace() {
        let mut c = classifier_with(vec![]);
        assert_suppressed(c.classify(RawEvent::Added(meta("ns", "early", "3"))), "snapshot-era");
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Added(meta("ns", "late", "4"))),
            EventType::Added,
            "late",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn modified_is_suppressed_during_catch_up() {
        let mut c = classifier_with(vec![meta("ns", "a", "1")]);
        assert_suppressed(c.classify(RawEvent::Modified(meta("ns", "a", "2"))), "catch-up");
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Modified(meta("ns", "a", "3"))),
            EventType::Modified,
            "a",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn modified_with_unchanged_version_is_noise() {
        let mut c = classifier_with(vec![meta("ns", "a", "5")]);
        advance(Duration::from_secs(31)).await;
        assert_suppressed(
            c.classify(RawEvent::Modified(meta("ns", "a", "5"))),
            "same-version",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn modified_unknown_key_is_treated_as_new() {
        let mut c = classifier_with(vec![]);
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Modified(meta("ns", "ghost", "2"))),
            EventType::Modified,
            "ghost",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_notifies_after_grace_and_untracks() {
        let mut c = classifier_with(vec![meta("ns", "a", "1")]);
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Deleted(meta("ns", "a", "9"))),
            EventType::Deleted,
            "a",
        );
        assert_eq!(c.tracked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_delete_is_deduplicated_until_the_window_expires() {
        // a reconnect replaying DELETED is the classic double-delivery case:
        // the key is no longer tracked, so only the dedup window stops it
        let mut c = classifier_with(vec![meta("ns", "gone", "4")]);
        advance(Duration::from_secs(31)).await;
        let replay = || RawEvent::Deleted(meta("ns", "gone", "5"));
        assert_delivers(c.classify(replay()), EventType::Deleted, "gone");
        assert_suppressed(c.classify(replay()), "duplicate");
        advance(Duration::from_secs(3601)).await;
        assert_delivers(c.classify(replay()), EventType::Deleted, "gone");
    }

    #[tokio::test(start_paused = true)]
    async fn hard_reset_clears_all_state() {
        let mut c = classifier_with(vec![meta("ns", "a", "1")]);
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Modified(meta("ns", "a", "2"))),
            EventType::Modified,
            "a",
        );
        let generation = c.generation();
        c.hard_reset();
        assert_eq!(c.tracked_len(), 0);
        assert_eq!(c.resource_version(), "");
        assert_eq!(c.generation(), generation + 1);
        // the same event passes dedup again in the rebuilt world
        c.install_snapshot("20".into(), vec![]);
        c.mark_watch_started();
        advance(Duration::from_secs(31)).await;
        assert_delivers(
            c.classify(RawEvent::Modified(meta("ns", "a", "2"))),
            EventType::Modified,
            "a",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exact_name_filter_discards_other_objects() {
        let mut c = Classifier::new(filter("Secret", "ns", "wanted"), &WatchTuning::default());
        c.install_snapshot("1".into(), vec![]);
        c.mark_watch_started();
        advance(Duration::from_secs(31)).await;
        assert_suppressed(
            c.classify(RawEvent::Added(meta("ns", "other", "2"))),
            "name-mismatch",
        );
        assert_eq!(c.tracked_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bookmarks_advance_the_checkpoint_silently() {
        let mut c = classifier_with(vec![]);
        match c.classify(RawEvent::Bookmark {
            resource_version: "99".into(),
        }) {
            Outcome::Advanced => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.resource_version(), "99");
        // an empty bookmark must not wipe the checkpoint
        c.classify(RawEvent::Bookmark {
            resource_version: String::new(),
        });
        assert_eq!(c.resource_version(), "99");
    }

    #[tokio::test(start_paused = true)]
    async fn object_events_advance_the_checkpoint() {
        let mut c = classifier_with(vec![meta("ns", "a", "1")]);
        c.classify(RawEvent::Modified(meta("ns", "a", "2")));
        assert_eq!(c.resource_version(), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn one_key_keeps_event_order() {
        let mut c = classifier_with(vec![]);
        advance(Duration::from_secs(31)).await;
        let mut seen = Vec::new();
        for event in [
            RawEvent::Added(meta("ns", "x", "1")),
            RawEvent::Modified(meta("ns", "x", "2")),
            RawEvent::Deleted(meta("ns", "x", "3")),
        ] {
            if let Outcome::Deliver(ev) = c.classify(event) {
                seen.push(ev.event_type);
            }
        }
        assert_eq!(
            seen,
            vec![EventType::Added, EventType::Modified, EventType::Deleted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_idle_tracked_entries() {
        let mut c = classifier_with(vec![meta("ns", "old", "1"), meta("ns", "busy", "2")]);
        advance(Duration::from_secs(23 * 3600)).await;
        // traffic refreshes one entry
        c.classify(RawEvent::Modified(meta("ns", "busy", "3")));
        advance(Duration::from_secs(2 * 3600)).await;
        assert_eq!(c.evict_stale_tracked(), 1);
        assert_eq!(c.tracked_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_expired_dedup_entries() {
        let mut c = classifier_with(vec![]);
        advance(Duration::from_secs(31)).await;
        c.classify(RawEvent::Modified(meta("ns", "a", "2")));
        assert_eq!(c.evict_expired_dedup(), 0);
        advance(Duration::from_secs(3601)).await;
        assert_eq!(c.evict_expired_dedup(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_events_terminate_not_notify() {
        let mut c = classifier_with(vec![]);
        match c.classify(RawEvent::Failed {
            message: "Expired: too old resource version".into(),
            code: 410,
        }) {
            Outcome::Fail { code, .. } => assert_eq!(code, 410),
            other => panic!("unexpected {other:?}"),
        }
    }
}
