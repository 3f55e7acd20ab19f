use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::experiment::{Experiment, ExperimentStatus, ExperimentStore, StoreError};

#[derive(Debug, Clone)]
struct StoredExperiment {
    id: u64,
    config: prost_types::Any,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    /// Set on explicit terminate/cancel; otherwise status derives from the
    /// time bounds.
    override_status: Option<ExperimentStatus>,
    termination_reason: Option<String>,
}

impl StoredExperiment {
    fn status_at(&self, now: SystemTime) -> ExperimentStatus {
        if let Some(status) = self.override_status {
            return status;
        }
        if now < self.start_time {
            return ExperimentStatus::Scheduled;
        }
        match self.end_time {
            Some(end) if now >= end => ExperimentStatus::Completed,
            _ => ExperimentStatus::Running,
        }
    }

    fn view(&self, now: SystemTime) -> Experiment {
        Experiment {
            id: self.id,
            config: self.config.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status_at(now),
            termination_reason: self.termination_reason.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    experiments: HashMap<u64, StoredExperiment>,
}

/// In-memory experiment store. Used as the composition-root default and by
/// the system tests; real deployments plug a persistent store in through the
/// [`ExperimentStore`] trait.
#[derive(Debug, Default)]
pub struct InMemoryExperimentStore {
    inner: Mutex<Inner>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn get_experiments(
        &self,
        config_type_urls: &[String],
        status: ExperimentStatus,
    ) -> Result<Vec<Experiment>, StoreError> {
        let now = SystemTime::now();
        let inner = self.inner.lock();
        let mut out: Vec<Experiment> = inner
            .experiments
            .values()
            .filter(|e| {
                config_type_urls.is_empty()
                    || config_type_urls.iter().any(|t| *t == e.config.type_url)
            })
            .filter(|e| e.status_at(now) == status)
            .map(|e| e.view(now))
            .collect();
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    async fn create_experiment(
        &self,
        config: prost_types::Any,
        start_time: SystemTime,
        end_time: Option<SystemTime>,
    ) -> Result<Experiment, StoreError> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let stored = StoredExperiment {
            id,
            config,
            start_time,
            end_time,
            override_status: None,
            termination_reason: None,
        };
        let view = stored.view(now);
        inner.experiments.insert(id, stored);
        Ok(view)
    }

    async fn terminate_experiment(&self, id: u64, reason: &str) -> Result<(), StoreError> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        let stored = inner
            .experiments
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        let status = stored.status_at(now);
        if status != ExperimentStatus::Running {
            return Err(StoreError::InvalidTransition {
                id,
                status,
                expected: ExperimentStatus::Running,
            });
        }
        stored.override_status = Some(ExperimentStatus::Stopped);
        stored.termination_reason = Some(reason.to_string());
        Ok(())
    }

    async fn cancel_experiment(&self, id: u64) -> Result<(), StoreError> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        let stored = inner
            .experiments
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        let status = stored.status_at(now);
        if status != ExperimentStatus::Scheduled {
            return Err(StoreError::InvalidTransition {
                id,
                status,
                expected: ExperimentStatus::Scheduled,
            });
        }
        stored.override_status = Some(ExperimentStatus::Canceled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opaque_config() -> prost_types::Any {
        prost_types::Any {
            type_url: "type.googleapis.com/google.protobuf.Empty".to_string(),
            value: Vec::new(),
        }
    }

    #[tokio::test]
    async fn status_derives_from_time_bounds() {
        let store = InMemoryExperimentStore::new();
        let now = SystemTime::now();

        let scheduled = store
            .create_experiment(opaque_config(), now + Duration::from_secs(3600), None)
            .await
            .unwrap();
        assert_eq!(scheduled.status, ExperimentStatus::Scheduled);

        let running = store
            .create_experiment(
                opaque_config(),
                now - Duration::from_secs(60),
                Some(now + Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        assert_eq!(running.status, ExperimentStatus::Running);

        let completed = store
            .create_experiment(
                opaque_config(),
                now - Duration::from_secs(3600),
                Some(now - Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_eq!(completed.status, ExperimentStatus::Completed);

        let running_set = store
            .get_experiments(&[], ExperimentStatus::Running)
            .await
            .unwrap();
        assert_eq!(running_set.len(), 1);
        assert_eq!(running_set[0].id, running.id);
    }

    #[tokio::test]
    async fn terminate_records_reason_and_hides_from_running() {
        let store = InMemoryExperimentStore::new();
        let now = SystemTime::now();
        let e = store
            .create_experiment(opaque_config(), now - Duration::from_secs(60), None)
            .await
            .unwrap();

        store.terminate_experiment(e.id, "expired").await.unwrap();

        let running = store
            .get_experiments(&[], ExperimentStatus::Running)
            .await
            .unwrap();
        assert!(running.is_empty());

        let stopped = store
            .get_experiments(&[], ExperimentStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].termination_reason.as_deref(), Some("expired"));

        // A second terminate is an invalid transition, not a silent no-op.
        let err = store.terminate_experiment(e.id, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_only_applies_to_scheduled() {
        let store = InMemoryExperimentStore::new();
        let now = SystemTime::now();

        let scheduled = store
            .create_experiment(opaque_config(), now + Duration::from_secs(3600), None)
            .await
            .unwrap();
        store.cancel_experiment(scheduled.id).await.unwrap();
        let canceled = store
            .get_experiments(&[], ExperimentStatus::Canceled)
            .await
            .unwrap();
        assert_eq!(canceled.len(), 1);

        let running = store
            .create_experiment(opaque_config(), now - Duration::from_secs(60), None)
            .await
            .unwrap();
        let err = store.cancel_experiment(running.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn type_url_filter_applies() {
        let store = InMemoryExperimentStore::new();
        let now = SystemTime::now();
        store
            .create_experiment(opaque_config(), now - Duration::from_secs(60), None)
            .await
            .unwrap();

        let filtered = store
            .get_experiments(
                &[faultline_protocol::INGRESS_FAULT_TYPE_URL.to_string()],
                ExperimentStatus::Running,
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());

        let unfiltered = store
            .get_experiments(&[], ExperimentStatus::Running)
            .await
            .unwrap();
        assert_eq!(unfiltered.len(), 1);
    }
}
