//! Watch session engine: one resumable, self-healing session per resource
//! filter, with snapshot baselines, reconnect policy and bounded startup
//! admission.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod classify;
pub mod health;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod source;

pub use registry::{SessionRegistry, SessionStats};
pub use session::{SessionCtx, SessionPhase};
pub use source::{EventStream, KubeSource, SnapshotPage, SourceError, WatchSource};

use std::sync::Arc;

use argus_core::{ResourceFilter, WatchTuning};
use argus_notify::Notifier;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Spawns and supervises one session per filter. The admission gate bounds
/// how many sessions may be in the listing phase at once; a permit is held
/// for the whole session lifetime, so steady-state watching is cheap for
/// the server while cold starts stay throttled.
pub struct Engine {
    tuning: WatchTuning,
    notifier: Arc<dyn Notifier>,
    registry: SessionRegistry,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(tuning: WatchTuning, notifier: Arc<dyn Notifier>, cancel: CancellationToken) -> Self {
        let gate = Arc::new(Semaphore::new(tuning.list_concurrency.max(1)));
        Self {
            tuning,
            notifier,
            registry: SessionRegistry::new(),
            gate,
            cancel,
        }
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch a session for one filter. A session that cannot win admission
    /// before the startup deadline is abandoned rather than started late.
    pub fn launch(&self, filter: ResourceFilter, source: Arc<dyn WatchSource>) -> JoinHandle<()> {
        let key = filter.session_key();
        self.registry.register(&key, filter.clone());
        let ctx = SessionCtx {
            filter,
            tuning: self.tuning.clone(),
            source,
            notifier: Arc::clone(&self.notifier),
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
        };
        let gate = Arc::clone(&self.gate);
        let deadline = self.tuning.startup_deadline();
        tokio::spawn(async move {
            let key = ctx.filter.session_key();
            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                acquired = timeout(deadline, gate.acquire_owned()) => match acquired {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => None,
                    Err(_) => {
                        warn!(session = %key, "no admission before the startup deadline, abandoning session");
                        None
                    }
                }
            };
            let Some(_permit) = permit else {
                ctx.registry.update(&key, |s| s.phase = SessionPhase::Stopped);
                return;
            };
            session::run(ctx).await;
        })
    }
}
