//! The per-filter watch session: baseline load, quiet period, watch pump,
//! reconnect pacing and hard-reset policy. One task owns everything here;
//! the only shared pieces are the registry, the health probe and the
//! process-wide cancellation token.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use argus_core::{object_key, ResourceFilter, WatchTuning};
use argus_notify::Notifier;
use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{reconnect_delay, Backoff};
use crate::classify::{Classifier, Outcome};
use crate::health::{spawn_watchdog, HealthProbe};
use crate::registry::SessionRegistry;
use crate::snapshot::{load_snapshot, SnapshotError};
use crate::source::{EventStream, SourceError, WatchSource};

/// Short fixed delay after a server-signalled stale checkpoint; this is an
/// expected condition, not a failure worth exponential pacing.
const RESET_DELAY: Duration = Duration::from_secs(1);
/// Cooldown after a forced reset caused by a reconnect storm.
const RESET_COOLDOWN: Duration = Duration::from_secs(30);
/// Ceiling for the linear pacing between ordinary reconnects.
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const OPEN_RETRY_BASE: Duration = Duration::from_secs(1);
const OPEN_RETRY_CAP: Duration = Duration::from_secs(300);
/// Sweep cadences for the state janitor arms of the pump.
const TRACKED_SWEEP: Duration = Duration::from_secs(3600);
const DEDUP_SWEEP: Duration = Duration::from_secs(300);

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    LoadingSnapshot,
    StartupDelay,
    Watching,
    Backoff,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::LoadingSnapshot => "loading-snapshot",
            SessionPhase::StartupDelay => "startup-delay",
            SessionPhase::Watching => "watching",
            SessionPhase::Backoff => "backoff",
            SessionPhase::Stopped => "stopped",
        })
    }
}

/// Everything one session needs; assembled by the engine facade.
pub struct SessionCtx {
    pub filter: ResourceFilter,
    pub tuning: WatchTuning,
    pub source: Arc<dyn WatchSource>,
    pub notifier: Arc<dyn Notifier>,
    pub registry: SessionRegistry,
    pub cancel: CancellationToken,
}

/// Drive one filter's session until shutdown or a fatal listing failure.
pub async fn run(ctx: SessionCtx) {
    let key = ctx.filter.session_key();
    let session_cancel = ctx.cancel.child_token();
    let probe = HealthProbe::new();
    let watchdog = spawn_watchdog(
        key.clone(),
        probe.clone(),
        ctx.tuning.heartbeat_interval(),
        session_cancel.clone(),
    );

    let mut classifier = Classifier::new(ctx.filter.clone(), &ctx.tuning);
    let mut tracked_janitor = interval(TRACKED_SWEEP);
    tracked_janitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dedup_janitor = interval(DEDUP_SWEEP);
    dedup_janitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(session = %key, kind = %ctx.filter.kind, "session starting");

    'lifecycle: loop {
        // The watch must not open before a baseline exists; that handoff is
        // what keeps the stream gap-free.
        set_phase(&ctx.registry, &key, SessionPhase::LoadingSnapshot);
        let snapshot = match load_snapshot(ctx.source.as_ref(), &ctx.tuning, &ctx.cancel).await {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::Cancelled) => break 'lifecycle,
            Err(SnapshotError::Exhausted(reason)) => {
                error!(session = %key, %reason, "initial listing retries exhausted, giving up on this filter");
                break 'lifecycle;
            }
        };
        let objects = snapshot.items.len();
        classifier.install_snapshot(snapshot.resource_version, snapshot.items);
        let tracked = classifier.tracked_len();
        ctx.registry.update(&key, |s| s.tracked_objects = tracked);
        info!(session = %key, objects, rv = %classifier.resource_version(), "snapshot loaded");

        // Quiet period so creations racing the listing settle before the
        // first watch open.
        set_phase(&ctx.registry, &key, SessionPhase::StartupDelay);
        if !idle(ctx.tuning.startup_delay(), &ctx.cancel).await {
            break 'lifecycle;
        }

        let mut open_backoff = Backoff::unbounded(OPEN_RETRY_BASE, OPEN_RETRY_CAP);
        let mut reconnects: u32 = 0;

        'watching: loop {
            if ctx.cancel.is_cancelled() {
                break 'lifecycle;
            }
            if reconnects > ctx.tuning.max_reconnects {
                // A checkpoint the server accepts but never serves well is
                // indistinguishable from a stale one; resync from scratch.
                warn!(session = %key, reconnects, "reconnect budget exhausted, forcing full resync");
                force_reset(&mut classifier, &ctx.registry, &key);
                if !idle(RESET_COOLDOWN, &ctx.cancel).await {
                    break 'lifecycle;
                }
                continue 'lifecycle;
            }

            set_phase(&ctx.registry, &key, SessionPhase::Watching);
            match ctx.source.open_watch(classifier.resource_version()).await {
                Err(SourceError::Stale(message)) => {
                    info!(session = %key, %message, "resume point rejected, rebuilding from a fresh listing");
                    force_reset(&mut classifier, &ctx.registry, &key);
                    if !idle(RESET_DELAY, &ctx.cancel).await {
                        break 'lifecycle;
                    }
                    continue 'lifecycle;
                }
                Err(SourceError::Api(message)) => {
                    reconnects += 1;
                    counter!("argus_watch_errors_total", 1u64, "session" => key.clone());
                    counter!("argus_watch_reconnects_total", 1u64, "session" => key.clone());
                    let delay = open_backoff.next_delay().unwrap_or(OPEN_RETRY_CAP);
                    warn!(
                        session = %key,
                        attempt = reconnects,
                        %message,
                        delay_ms = delay.as_millis() as u64,
                        "watch open failed"
                    );
                    ctx.registry.update(&key, |s| {
                        s.reconnects = reconnects;
                        s.consecutive_failures += 1;
                        s.connection_healthy = false;
                    });
                    set_phase(&ctx.registry, &key, SessionPhase::Backoff);
                    if !idle(delay, &ctx.cancel).await {
                        break 'lifecycle;
                    }
                    continue 'watching;
                }
                Ok(stream) => {
                    probe.arm();
                    classifier.mark_watch_started();
                    open_backoff.reset();
                    ctx.registry.update(&key, |s| {
                        s.consecutive_failures = 0;
                        s.connection_healthy = true;
                        s.last_successful_watch_at = Some(Utc::now());
                    });
                    debug!(session = %key, rv = %classifier.resource_version(), "watch open");

                    match pump(
                        stream,
                        &ctx,
                        &key,
                        &probe,
                        &mut classifier,
                        &mut tracked_janitor,
                        &mut dedup_janitor,
                    )
                    .await
                    {
                        PumpEnd::Cancelled => break 'lifecycle,
                        PumpEnd::Stale(message) => {
                            info!(session = %key, %message, "checkpoint expired mid-stream, rebuilding");
                            force_reset(&mut classifier, &ctx.registry, &key);
                            if !idle(RESET_DELAY, &ctx.cancel).await {
                                break 'lifecycle;
                            }
                            continue 'lifecycle;
                        }
                        PumpEnd::Ended(reason) => {
                            reconnects += 1;
                            counter!("argus_watch_reconnects_total", 1u64, "session" => key.clone());
                            let delay =
                                reconnect_delay(reconnects, ctx.tuning.reconnect_backoff(), RECONNECT_CAP);
                            info!(
                                session = %key,
                                reason,
                                attempt = reconnects,
                                delay_ms = delay.as_millis() as u64,
                                "watch ended, reconnecting"
                            );
                            ctx.registry.update(&key, |s| {
                                s.reconnects = reconnects;
                                s.connection_healthy = false;
                            });
                            set_phase(&ctx.registry, &key, SessionPhase::Backoff);
                            if !idle(delay, &ctx.cancel).await {
                                break 'lifecycle;
                            }
                            continue 'watching;
                        }
                    }
                }
            }
        }
    }

    session_cancel.cancel();
    let _ = watchdog.await;
    ctx.registry.update(&key, |s| {
        s.phase = SessionPhase::Stopped;
        s.connection_healthy = false;
    });
    info!(session = %key, "session stopped");
}

enum PumpEnd {
    Cancelled,
    Stale(String),
    Ended(&'static str),
}

/// Drain one open stream. Janitor arms keep the classifier's maps bounded
/// while the session sits here, which is where it spends its life.
async fn pump(
    mut stream: EventStream,
    ctx: &SessionCtx,
    key: &str,
    probe: &HealthProbe,
    classifier: &mut Classifier,
    tracked_janitor: &mut Interval,
    dedup_janitor: &mut Interval,
) -> PumpEnd {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return PumpEnd::Cancelled,
            _ = probe.stalled() => {
                warn!(session = %key, "recycling stalled connection");
                return PumpEnd::Ended("stalled");
            }
            _ = tracked_janitor.tick() => {
                let evicted = classifier.evict_stale_tracked();
                if evicted > 0 {
                    debug!(session = %key, evicted, "dropped idle baseline entries");
                    let tracked = classifier.tracked_len();
                    ctx.registry.update(key, |s| s.tracked_objects = tracked);
                }
            }
            _ = dedup_janitor.tick() => {
                classifier.evict_expired_dedup();
            }
            item = stream.next() => match item {
                None => return PumpEnd::Ended("stream-end"),
                Some(Err(SourceError::Stale(message))) => return PumpEnd::Stale(message),
                Some(Err(SourceError::Api(message))) => {
                    counter!("argus_watch_errors_total", 1u64, "session" => key.to_string());
                    warn!(session = %key, %message, "watch stream error");
                    return PumpEnd::Ended("stream-error");
                }
                Some(Ok(event)) => {
                    probe.beat();
                    counter!("argus_events_received_total", 1u64, "session" => key.to_string());
                    match classifier.classify(event) {
                        Outcome::Deliver(change) => {
                            counter!("argus_events_processed_total", 1u64, "session" => key.to_string());
                            debug!(
                                session = %key,
                                event = %change.event_type,
                                object = %object_key(&change.namespace, &change.name),
                                rv = %change.resource_version,
                                "delivering change"
                            );
                            if let Err(err) = ctx.notifier.deliver(&change).await {
                                counter!("argus_notify_failures_total", 1u64, "session" => key.to_string());
                                warn!(session = %key, error = %err, "notification delivery failed");
                            }
                            ctx.registry.update(key, |s| s.last_delivery_at = Some(Utc::now()));
                        }
                        Outcome::Suppressed(reason) => {
                            counter!(
                                "argus_events_skipped_total",
                                1u64,
                                "session" => key.to_string(),
                                "reason" => reason
                            );
                        }
                        Outcome::Advanced => {}
                        Outcome::Fail { message, code } => {
                            counter!("argus_watch_errors_total", 1u64, "session" => key.to_string());
                            if argus_kubehub::is_stale_signal(code, &message) {
                                return PumpEnd::Stale(message);
                            }
                            warn!(session = %key, code, %message, "server reported watch failure");
                            return PumpEnd::Ended("failure-event");
                        }
                    }
                }
            }
        }
    }
}

fn force_reset(classifier: &mut Classifier, registry: &SessionRegistry, key: &str) {
    counter!("argus_hard_resets_total", 1u64, "session" => key.to_string());
    classifier.hard_reset();
    registry.update(key, |s| {
        s.hard_resets += 1;
        s.reconnects = 0;
        s.consecutive_failures = 0;
        s.tracked_objects = 0;
        s.connection_healthy = false;
    });
}

fn set_phase(registry: &SessionRegistry, key: &str, phase: SessionPhase) {
    registry.update(key, |s| s.phase = phase);
}

/// Sleep that loses to shutdown; false means cancelled.
async fn idle(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(wait) => true,
    }
}
