use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::criteria::TerminationCriterion;
use crate::experiment::{Experiment, ExperimentStatus, ExperimentStore};
use crate::telemetry::{RoutineGuard, Telemetry};

/// Watches running experiments and force-stops the ones a termination
/// criterion rejects.
///
/// One outer loop polls the store at a coarse interval and keeps a routine
/// per running experiment; each routine re-evaluates every criterion at a
/// finer interval. The split keeps store pressure steady (mostly the outer
/// poll) while one slow experiment check cannot delay the others.
pub struct Monitor {
    store: Arc<dyn ExperimentStore>,
    criteria: Vec<Arc<dyn TerminationCriterion>>,
    enabled_config_types: Vec<String>,
    outer_loop_interval: Duration,
    per_experiment_check_interval: Duration,
    telemetry: Telemetry,
}

pub struct MonitorHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    /// Stops the outer loop and cancels every per-experiment routine.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

impl Monitor {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        criteria: Vec<Arc<dyn TerminationCriterion>>,
        enabled_config_types: Vec<String>,
        outer_loop_interval: Duration,
        per_experiment_check_interval: Duration,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            criteria,
            enabled_config_types,
            outer_loop_interval,
            per_experiment_check_interval,
            telemetry,
        }
    }

    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        // Cancellation handle per tracked experiment id. Dropping the map on
        // exit cancels every routine.
        let mut tracked: HashMap<u64, oneshot::Sender<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.outer_loop_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = ticker.tick() => {
                    let experiments = match self
                        .store
                        .get_experiments(&self.enabled_config_types, ExperimentStatus::Running)
                        .await
                    {
                        Ok(experiments) => experiments,
                        Err(err) => {
                            // Skip the tick; the tracked set is preserved so
                            // routines keep evaluating under the last view.
                            tracing::error!(error = %err, "failed to retrieve experiments from store");
                            continue;
                        }
                    };

                    let active: HashSet<u64> = experiments.iter().map(|e| e.id).collect();

                    for experiment in experiments {
                        if !tracked.contains_key(&experiment.id) {
                            let id = experiment.id;
                            tracked.insert(id, self.spawn_experiment_routine(experiment));
                        }
                    }

                    let stale: Vec<u64> = tracked
                        .keys()
                        .filter(|id| !active.contains(*id))
                        .copied()
                        .collect();
                    for id in stale {
                        if let Some(cancel) = tracked.remove(&id) {
                            let _ = cancel.send(());
                        }
                    }
                }
            }
        }
    }

    fn spawn_experiment_routine(&self, experiment: Experiment) -> oneshot::Sender<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let guard = RoutineGuard::new(&self.telemetry);
        let store = Arc::clone(&self.store);
        let criteria = self.criteria.clone();
        let telemetry = self.telemetry.clone();
        let check_interval = self.per_experiment_check_interval;

        tokio::spawn(async move {
            let _guard = guard;
            monitor_experiment(store, criteria, check_interval, telemetry, experiment, cancel_rx)
                .await;
        });

        cancel_tx
    }
}

async fn monitor_experiment(
    store: Arc<dyn ExperimentStore>,
    criteria: Vec<Arc<dyn TerminationCriterion>>,
    check_interval: Duration,
    telemetry: Telemetry,
    experiment: Experiment,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut terminated = false;

    loop {
        tokio::select! {
            _ = &mut cancel => return,
            _ = ticker.tick() => {
                if terminated {
                    // Keep ticking as a no-op until the outer loop observes
                    // the status change and cancels us. Exiting here races
                    // the outer loop, which could respawn a routine for an
                    // experiment the store still reports as running.
                    continue;
                }

                for criterion in &criteria {
                    let verdict = catch_unwind(AssertUnwindSafe(|| {
                        criterion.should_terminate(experiment.start_time, &experiment)
                    }));
                    let reason = match verdict {
                        Err(_) => {
                            tracing::error!(
                                experiment_id = experiment.id,
                                "termination criterion panicked; treating as non-terminating"
                            );
                            continue;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(
                                experiment_id = experiment.id,
                                error = %err,
                                "termination criterion failed to evaluate"
                            );
                            continue;
                        }
                        Ok(Ok(None)) => continue,
                        Ok(Ok(Some(reason))) => reason,
                    };

                    match store.terminate_experiment(experiment.id, &reason).await {
                        Ok(()) => {
                            tracing::info!(
                                experiment_id = experiment.id,
                                reason = %reason,
                                "terminated experiment"
                            );
                            telemetry.record_termination();
                            terminated = true;
                            break;
                        }
                        Err(err) => {
                            // The criterion will fire again next tick.
                            tracing::error!(
                                experiment_id = experiment.id,
                                error = %err,
                                "failed to terminate experiment"
                            );
                        }
                    }
                }
            }
        }
    }
}
