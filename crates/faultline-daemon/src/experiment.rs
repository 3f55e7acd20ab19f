use std::time::SystemTime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment {0} not found")]
    NotFound(u64),
    #[error("experiment {id} is {status:?}, expected {expected:?}")]
    InvalidTransition {
        id: u64,
        status: ExperimentStatus,
        expected: ExperimentStatus,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentStatus {
    Scheduled,
    Running,
    Completed,
    Canceled,
    Stopped,
}

/// A scheduled or running fault-injection run. The config payload is opaque
/// to everything but the snapshot builder; its type URL decides which
/// flattening (if any) applies.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub id: u64,
    pub config: prost_types::Any,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub status: ExperimentStatus,
    /// Reason recorded when the experiment was force-stopped.
    pub termination_reason: Option<String>,
}

/// Persistence seam for experiments. The production implementation lives in
/// an external storage service; the daemon only depends on this interface.
#[async_trait::async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Experiments whose config type URL is in `config_type_urls` (empty
    /// matches all) and whose status equals `status`.
    async fn get_experiments(
        &self,
        config_type_urls: &[String],
        status: ExperimentStatus,
    ) -> Result<Vec<Experiment>, StoreError>;

    async fn create_experiment(
        &self,
        config: prost_types::Any,
        start_time: SystemTime,
        end_time: Option<SystemTime>,
    ) -> Result<Experiment, StoreError>;

    /// Force-stops a Running experiment, recording `reason`.
    async fn terminate_experiment(&self, id: u64, reason: &str) -> Result<(), StoreError>;

    /// Cancels a Scheduled experiment before it starts.
    async fn cancel_experiment(&self, id: u64) -> Result<(), StoreError>;
}
