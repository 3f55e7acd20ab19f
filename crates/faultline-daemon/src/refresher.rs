use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::cache::SnapshotCache;
use crate::experiment::{ExperimentStatus, ExperimentStore};
use crate::snapshot::{build_snapshots, RuntimeSnapshot};

/// Periodically rebuilds runtime snapshots from the experiment store and
/// installs them in the cache. This cadence bounds how stale the data plane's
/// view of the running experiment set can get.
pub struct Refresher {
    store: Arc<dyn ExperimentStore>,
    cache: Arc<SnapshotCache>,
    enabled_config_types: Vec<String>,
    refresh_interval: Duration,
    ingress_prefix: String,
    egress_prefix: String,
}

pub struct RefresherHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl RefresherHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

impl Refresher {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        cache: Arc<SnapshotCache>,
        enabled_config_types: Vec<String>,
        refresh_interval: Duration,
        ingress_prefix: String,
        egress_prefix: String,
    ) -> Self {
        Self {
            store,
            cache,
            enabled_config_types,
            refresh_interval,
            ingress_prefix,
            egress_prefix,
        }
    }

    pub fn spawn(self) -> RefresherHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(shutdown_rx));
        RefresherHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        // Clusters we installed a non-empty snapshot for on the previous
        // tick; anything that drops out gets the empty snapshot so removed
        // faults converge on the data plane.
        let mut populated: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(self.refresh_interval);
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
                            tracing::error!(error = %err, "refresh skipped: failed to query experiments");
                            continue;
                        }
                    };

                    let snapshots =
                        build_snapshots(&experiments, &self.ingress_prefix, &self.egress_prefix);

                    let current: HashSet<String> = snapshots.keys().cloned().collect();
                    for (cluster, snapshot) in snapshots {
                        self.cache.set_snapshot(&cluster, snapshot);
                    }
                    for stale in populated.difference(&current) {
                        self.cache.set_snapshot(stale, RuntimeSnapshot::empty());
                    }
                    populated = current;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryExperimentStore;
    use faultline_protocol::pack_message;
    use faultline_protocol::pb::chaos;
    use std::time::SystemTime;

    fn ingress_abort(cluster: &str, percent: u32) -> prost_types::Any {
        pack_message(
            faultline_protocol::INGRESS_FAULT_TYPE_URL,
            &chaos::IngressFaultConfig {
                cluster: cluster.to_string(),
                fault: Some(chaos::ingress_fault_config::Fault::Abort(
                    chaos::AbortFault {
                        percent,
                        http_status: 503,
                    },
                )),
            },
        )
    }

    #[tokio::test]
    async fn terminated_experiments_vanish_from_the_cache() {
        let store = Arc::new(InMemoryExperimentStore::new());
        let cache = Arc::new(SnapshotCache::new());
        let experiment = store
            .create_experiment(
                ingress_abort("storefront", 25),
                SystemTime::now() - Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();

        let refresher = Refresher::new(
            store.clone(),
            cache.clone(),
            Vec::new(),
            Duration::from_millis(20),
            "fault.http".to_string(),
            "egress.fault.http".to_string(),
        );
        let handle = refresher.spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some((snapshot, _)) = cache.get("storefront") {
                if !snapshot.is_empty() {
                    break;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for snapshot to appear");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store
            .terminate_experiment(experiment.id, "expired")
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some((snapshot, _)) = cache.get("storefront") {
                if snapshot.is_empty() {
                    break;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for snapshot to empty");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown().await;
    }
}
