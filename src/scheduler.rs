//! Periodic decay passes and batch cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::coordinator::PersonaEngine;
use crate::memory::decay::DecayEngine;

pub struct Scheduler;

/// Running scheduler loops. Dropping the handle leaves them running; call [`SchedulerHandle::shutdown`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the batch loop, and the decay loop if `decay` is given.
    ///
    /// The first tick of each loop fires one full period after start.
    pub fn spawn(engine: Arc<PersonaEngine>, decay: Option<DecayEngine>, config: SchedulerConfig) -> SchedulerHandle {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Some(decay) = decay {
            let period = Duration::from_secs(config.decay_interval_secs);
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stop.changed() => break,
                    }
                    match decay.run_pass().await {
                        Ok(Some(report)) => info!(
                            nodes_pruned = report.nodes_pruned,
                            memories_pruned = report.memories_pruned,
                            duration_ms = report.duration_ms,
                            "scheduled decay complete"
                        ),
                        Ok(None) => warn!("scheduled decay skipped, previous pass still running"),
                        Err(e) => error!(error = %e, "scheduled decay failed"),
                    }
                }
            }));
        }

        let period = Duration::from_secs(config.batch_interval_secs);
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                match engine.run_batch_cycle().await {
                    Ok(report) if report.delivered > 0 => {
                        info!(delivered = report.delivered, "autonomous replies sent to outbox")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "batch cycle failed"),
                }
            }
        }));

        info!(
            decay_secs = config.decay_interval_secs,
            batch_secs = config.batch_interval_secs,
            loops = tasks.len(),
            "scheduler started"
        );
        SchedulerHandle { shutdown, tasks }
    }
}

impl SchedulerHandle {
    /// Signal both loops and wait for them. A pass already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task failed");
            }
        }
        info!("scheduler stopped");
    }
}
