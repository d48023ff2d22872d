use std::sync::Mutex;

use async_trait::async_trait;
use cloudhop_contract::WorkflowState;
use cloudhop_storage::MigrationStorage;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::WorkflowError;
use crate::runtime::RunEvent;

/// Progress handed out after every step, whether it succeeded or not.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint<'a> {
    pub state: &'a WorkflowState,
    pub completed_steps: &'a [String],
    /// Most recently completed step.
    pub last_step: Option<&'a str>,
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn record(&self, checkpoint: Checkpoint<'_>) -> Result<(), WorkflowError>;

    async fn step_completed(&self, _step: &str) {}

    async fn step_failed(&self, _step: &str, _error: &WorkflowError) {}
}

pub struct NoCheckpoints;

#[async_trait]
impl CheckpointSink for NoCheckpoints {
    async fn record(&self, _checkpoint: Checkpoint<'_>) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// Keeps every checkpoint in memory, newest last.
#[derive(Default)]
pub struct MemoryCheckpoints {
    saved: Mutex<Vec<(WorkflowState, Vec<String>)>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<(WorkflowState, Vec<String>)> {
        self.saved
            .lock()
            .ok()
            .and_then(|saved| saved.last().cloned())
    }

    pub fn len(&self) -> usize {
        self.saved.lock().map(|saved| saved.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpoints {
    async fn record(&self, checkpoint: Checkpoint<'_>) -> Result<(), WorkflowError> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| WorkflowError::Checkpoint("checkpoint list poisoned".to_string()))?;
        saved.push((checkpoint.state.clone(), checkpoint.completed_steps.to_vec()));
        Ok(())
    }
}

/// Persists checkpoints of one run and publishes step events.
pub struct StorageCheckpoints {
    storage: MigrationStorage,
    run_id: String,
    events: broadcast::Sender<RunEvent>,
}

impl StorageCheckpoints {
    pub fn new(
        storage: MigrationStorage,
        run_id: impl Into<String>,
        events: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self {
            storage,
            run_id: run_id.into(),
            events,
        }
    }
}

#[async_trait]
impl CheckpointSink for StorageCheckpoints {
    async fn record(&self, checkpoint: Checkpoint<'_>) -> Result<(), WorkflowError> {
        self.storage
            .save_checkpoint(
                &self.run_id,
                checkpoint.state,
                checkpoint.completed_steps,
                checkpoint.last_step,
            )
            .await
            .map_err(|err| WorkflowError::Checkpoint(format!("{err:#}")))
    }

    async fn step_completed(&self, step: &str) {
        let _ = self.events.send(RunEvent::StepCompleted {
            run_id: self.run_id.clone(),
            step: step.to_string(),
        });
    }

    async fn step_failed(&self, step: &str, error: &WorkflowError) {
        warn!(run_id = %self.run_id, step = %step, error = %error, "step failed");
        let _ = self.events.send(RunEvent::StepFailed {
            run_id: self.run_id.clone(),
            step: step.to_string(),
            error: error.to_string(),
        });
    }
}
