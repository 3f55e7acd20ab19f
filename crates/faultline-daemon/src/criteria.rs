use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::experiment::Experiment;

#[derive(Debug, Error)]
pub enum CriterionError {
    #[error("criterion evaluation failed: {0}")]
    Evaluation(String),
}

/// Decides whether a running experiment should be force-stopped. Criteria see
/// only the experiment itself; they do not consult external telemetry.
pub trait TerminationCriterion: Send + Sync {
    /// `Some(reason)` terminates the experiment. `Err` means "could not
    /// evaluate this tick" and is logged without terminating.
    fn should_terminate(
        &self,
        started_at: SystemTime,
        experiment: &Experiment,
    ) -> Result<Option<String>, CriterionError>;
}

/// Terminates experiments that have been running longer than `max_duration`.
#[derive(Debug, Clone)]
pub struct MaxDurationCriterion {
    max_duration: Duration,
}

impl MaxDurationCriterion {
    pub fn new(max_duration: Duration) -> Self {
        Self { max_duration }
    }
}

impl TerminationCriterion for MaxDurationCriterion {
    fn should_terminate(
        &self,
        started_at: SystemTime,
        _experiment: &Experiment,
    ) -> Result<Option<String>, CriterionError> {
        let elapsed = SystemTime::now()
            .duration_since(started_at)
            .unwrap_or(Duration::ZERO);
        if elapsed > self.max_duration {
            return Ok(Some(format!(
                "exceeded maximum duration of {}s",
                self.max_duration.as_secs()
            )));
        }
        Ok(None)
    }
}
