//! Background eviction of idle throttle state.
//!
//! A [`Sweeper`] owns a tokio task that periodically runs every registered
//! sweep target. It is started explicitly and stopped with
//! [`Sweeper::shutdown`]; dropping the handle aborts the task so that no timer
//! outlives its owner.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

type SweepFn = Box<dyn Fn() -> usize + Send + Sync>;

struct SweepTarget {
    name: String,
    sweep: SweepFn,
}

/// Collects sweep targets before the task is spawned.
#[derive(Default)]
pub struct SweeperBuilder {
    targets: Vec<SweepTarget>,
}

impl SweeperBuilder {
    /// Register a sweep function. It returns the number of evicted keys.
    pub fn target<F>(mut self, name: impl Into<String>, sweep: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.targets.push(SweepTarget {
            name: name.into(),
            sweep: Box::new(sweep),
        });
        self
    }

    /// Start sweeping every `interval`. Must be called inside a tokio runtime.
    pub fn spawn(self, interval: Duration) -> Sweeper {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let targets = self.targets;

        info!(
            interval_ms = interval.as_millis() as u64,
            targets = targets.len(),
            "Starting throttle sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_all(&targets);
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Throttle sweeper received shutdown");
                        break;
                    }
                }
            }
        });

        Sweeper {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }
}

/// Run every target once. A panicking target is logged and skipped.
fn sweep_all(targets: &[SweepTarget]) -> usize {
    let mut total = 0;
    for target in targets {
        match catch_unwind(AssertUnwindSafe(|| (target.sweep)())) {
            Ok(evicted) => {
                debug!(sweep_target = %target.name, evicted, "Sweep completed");
                total += evicted;
            }
            Err(_) => {
                error!(sweep_target = %target.name, "Sweep panicked, continuing");
            }
        }
    }
    total
}

/// Handle to a running sweep task.
pub struct Sweeper {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn builder() -> SweeperBuilder {
        SweeperBuilder::default()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the task and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Throttle sweeper task failed");
            }
            info!("Throttle sweeper stopped");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("running", &self.is_running())
            .finish()
    }
}
