//! Per-session heartbeat watchdog. The probe is the only state shared
//! between a session and its watchdog task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A connection is declared stalled after this many silent intervals.
const STALL_FACTOR: u32 = 3;

#[derive(Clone)]
pub struct HealthProbe {
    inner: Arc<ProbeInner>,
}

struct ProbeInner {
    healthy: AtomicBool,
    stall: AtomicBool,
    last_beat: Mutex<Instant>,
    kicked: Notify,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                healthy: AtomicBool::new(false),
                stall: AtomicBool::new(false),
                last_beat: Mutex::new(Instant::now()),
                kicked: Notify::new(),
            }),
        }
    }

    /// Called when a watch opens: presumed healthy until traffic stops.
    /// Voids any stall verdict aimed at a previous connection.
    pub fn arm(&self) {
        self.touch();
        self.inner.stall.store(false, Ordering::Relaxed);
        self.inner.healthy.store(true, Ordering::Relaxed);
    }

    /// Any stream traffic counts, bookmarks included.
    pub fn beat(&self) {
        self.touch();
        self.inner.healthy.store(true, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    pub fn since_last_beat(&self) -> Duration {
        let last = *self
            .inner
            .last_beat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Instant::now().duration_since(last)
    }

    /// Resolves when the watchdog declares the current connection stalled.
    /// Uses a stored permit so a kick is not lost while the session is busy
    /// delivering; the latch re-check discards a permit left over from a
    /// connection that is already gone.
    pub async fn stalled(&self) {
        loop {
            self.inner.kicked.notified().await;
            if self.inner.stall.swap(false, Ordering::Relaxed) {
                return;
            }
        }
    }

    fn mark_stalled(&self) {
        self.inner.healthy.store(false, Ordering::Relaxed);
        self.inner.stall.store(true, Ordering::Relaxed);
        self.inner.kicked.notify_one();
    }

    fn touch(&self) {
        *self
            .inner
            .last_beat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog task: flags the session when an armed connection has gone
/// silent for longer than three intervals.
pub fn spawn_watchdog(
    session: String,
    probe: HealthProbe,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stall_after = every * STALL_FACTOR;
        let mut ticker = interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if probe.is_healthy() && probe.since_last_beat() > stall_after {
                        warn!(
                            session = %session,
                            silent_secs = probe.since_last_beat().as_secs(),
                            "no watch traffic, marking connection stale"
                        );
                        probe.mark_stalled();
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_flagged_after_three_intervals() {
        let probe = HealthProbe::new();
        probe.arm();
        let cancel = CancellationToken::new();
        let dog = spawn_watchdog(
            "t/ns".into(),
            probe.clone(),
            Duration::from_secs(1),
            cancel.clone(),
        );
        timeout(Duration::from_secs(10), probe.stalled())
            .await
            .expect("watchdog never fired");
        assert!(!probe.is_healthy());
        cancel.cancel();
        let _ = dog.await;
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_the_connection_healthy() {
        let probe = HealthProbe::new();
        probe.arm();
        let cancel = CancellationToken::new();
        let dog = spawn_watchdog(
            "t/ns".into(),
            probe.clone(),
            Duration::from_secs(1),
            cancel.clone(),
        );
        for _ in 0..10 {
            advance(Duration::from_millis(900)).await;
            probe.beat();
        }
        assert!(probe.is_healthy());
        cancel.cancel();
        let _ = dog.await;
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_probe_is_never_flagged() {
        let probe = HealthProbe::new();
        let cancel = CancellationToken::new();
        let dog = spawn_watchdog(
            "t/ns".into(),
            probe.clone(),
            Duration::from_secs(1),
            cancel.clone(),
        );
        advance(Duration::from_secs(30)).await;
        assert!(
            timeout(Duration::from_millis(1), probe.stalled())
                .await
                .is_err(),
            "stall flagged without an armed connection"
        );
        cancel.cancel();
        let _ = dog.await;
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_voids_a_kick_left_by_a_dead_connection() {
        let probe = HealthProbe::new();
        probe.arm();
        let cancel = CancellationToken::new();
        let dog = spawn_watchdog(
            "t/ns".into(),
            probe.clone(),
            Duration::from_secs(1),
            cancel.clone(),
        );
        // the watchdog fires while nobody is listening; the kick is parked
        timeout(Duration::from_secs(60), async {
            while probe.is_healthy() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .expect("watchdog never flagged the silent connection");
        assert!(!probe.is_healthy());
        cancel.cancel();
        let _ = dog.await;

        probe.arm();
        assert!(
            timeout(Duration::from_secs(60), probe.stalled())
                .await
                .is_err(),
            "stale kick recycled a fresh connection"
        );
    }
}
