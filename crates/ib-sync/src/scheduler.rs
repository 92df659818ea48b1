//! Poll scheduler
//!
//! Runs the reconciler after an initial delay and then on a fixed period. At
//! most one cycle is in flight: a scheduled tick that falls inside a running
//! cycle is dropped, and an on-demand trigger that finds a cycle running is
//! reported as skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;
use crate::report::SyncReport;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub poll_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(10),
            poll_period: Duration::from_secs(600),
        }
    }
}

/// Result of asking for a cycle
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(SyncReport),
    Failed(String),
    /// Another cycle was already running
    Skipped,
}

#[derive(Clone)]
struct CycleRunner {
    reconciler: Arc<Reconciler>,
    cycle_lock: Arc<Mutex<()>>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

impl CycleRunner {
    async fn run(&self) -> TriggerOutcome {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("Sync cycle already running, skipping trigger");
            metrics::counter!("sync.cycles_skipped_total").increment(1);
            return TriggerOutcome::Skipped;
        };

        match self.reconciler.run_cycle().await {
            Ok(report) => {
                *self.last_report.write() = Some(report.clone());
                TriggerOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "Sync cycle failed");
                metrics::counter!("sync.cycles_failed_total").increment(1);
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }
}

pub struct SyncScheduler {
    config: SchedulerConfig,
    runner: CycleRunner,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, reconciler: Arc<Reconciler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            runner: CycleRunner {
                reconciler,
                cycle_lock: Arc::new(Mutex::new(())),
                last_report: Arc::new(RwLock::new(None)),
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Spawn the periodic loop. No-op when disabled or already started.
    pub fn start(&self) {
        if !self.config.enabled {
            info!("Sync scheduler is disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sync scheduler already running");
            return;
        }

        info!(
            initial_delay_secs = self.config.initial_delay.as_secs(),
            poll_period_secs = self.config.poll_period.as_secs(),
            "Starting sync scheduler"
        );

        let runner = self.runner.clone();
        let running = self.running.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(config.initial_delay) => {}
                _ = shutdown_rx.recv() => {
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }

            let mut ticker = interval(config.poll_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        runner.run().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            running.store(false, Ordering::SeqCst);
            info!("Sync scheduler stopped");
        });
    }

    /// Run a cycle now unless one is already in flight.
    pub async fn trigger(&self) -> TriggerOutcome {
        self.runner.run().await
    }

    /// Run the destructive clear under the cycle lock. `None` when a cycle is
    /// in flight.
    pub async fn clear(&self) -> Option<crate::Result<usize>> {
        let _guard = self.runner.cycle_lock.try_lock().ok()?;
        Some(self.runner.reconciler.clear_mirrored_subtrees().await)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.runner.last_report.read().clone()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.runner.reconciler
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
