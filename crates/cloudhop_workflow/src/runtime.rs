use anyhow::{bail, Context, Result};
use cloudhop_contract::{MigrationRequest, ServerHandle};
use cloudhop_storage::{MigrationStorage, RunRecord, RunStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::checkpoint::StorageCheckpoints;
use crate::config::MigrationConfig;
use crate::context::MigrationDeps;
use crate::engine::Migration;

/// Progress of persisted runs, fanned out to whoever subscribes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StatusChanged {
        run_id: String,
        status: RunStatus,
        reason: Option<String>,
    },
    StepCompleted {
        run_id: String,
        step: String,
    },
    StepFailed {
        run_id: String,
        step: String,
        error: String,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "run.status.changed",
            Self::StepCompleted { .. } => "step.completed",
            Self::StepFailed { .. } => "step.failed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::StatusChanged { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. } => run_id,
        }
    }
}

/// Runs migrations against persisted run records, checkpointing after every
/// step so an interrupted run can be resumed.
#[derive(Clone)]
pub struct MigrationRuntime {
    deps: MigrationDeps,
    storage: MigrationStorage,
    events: broadcast::Sender<RunEvent>,
}

impl MigrationRuntime {
    pub fn new(deps: MigrationDeps, storage: MigrationStorage) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            deps,
            storage,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn storage(&self) -> &MigrationStorage {
        &self.storage
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.deps.config
    }

    pub fn deps(&self) -> &MigrationDeps {
        &self.deps
    }

    pub async fn submit(&self, request: &MigrationRequest, run_id: Option<&str>) -> Result<RunRecord> {
        let run = self.storage.create_run(request, run_id).await?;
        info!(run_id = %run.run_id, instance = %run.instance_name, "migration queued");
        self.emit_status(&run.run_id, RunStatus::Queued, None);
        Ok(run)
    }

    /// Drives a run to completion. A stored checkpoint is resumed; `supplied`
    /// replaces the stored request when given. A run already being executed
    /// is refused.
    pub async fn execute(
        &self,
        run_id: &str,
        supplied: Option<MigrationRequest>,
    ) -> Result<ServerHandle> {
        let run = self
            .storage
            .get_run(run_id)
            .await?
            .with_context(|| format!("run {run_id} not found"))?;
        if !self.storage.claim_run(run_id).await? {
            bail!("run {run_id} is already running");
        }
        self.emit_status(run_id, RunStatus::Running, None);

        let migration = match self.load(&run, supplied).await {
            Ok(migration) => migration,
            Err(err) => {
                let reason = format!("{err:#}");
                error!(run_id = %run_id, reason = %reason, "migration could not be loaded");
                self.set_status(run_id, RunStatus::Failed, Some(&reason)).await?;
                return Err(err);
            }
        };

        let sink = StorageCheckpoints::new(self.storage.clone(), run_id, self.events.clone());
        let span = info_span!("migration", run_id = %run_id, instance = %run.instance_name);

        match migration.finish(&sink).instrument(span).await {
            Ok(instance) => {
                info!(run_id = %run_id, instance_id = %instance.id, "migration finished");
                self.set_status(run_id, RunStatus::Success, None).await?;
                Ok(instance)
            }
            Err(err) => {
                let reason = match err.failed_step() {
                    Some(step) => format!("{step}: {}", err.root()),
                    None => err.to_string(),
                };
                error!(run_id = %run_id, reason = %reason, "migration failed");
                self.set_status(run_id, RunStatus::Failed, Some(&reason)).await?;
                Err(anyhow::Error::new(err).context(format!("run {run_id} failed")))
            }
        }
    }

    async fn load(&self, run: &RunRecord, supplied: Option<MigrationRequest>) -> Result<Migration> {
        match self.storage.load_checkpoint(&run.run_id).await? {
            Some(checkpoint) => Migration::restore(
                &self.deps,
                checkpoint.state,
                supplied,
                checkpoint.completed_steps,
            )
            .with_context(|| format!("restore run {}", run.run_id)),
            None => {
                let request = match supplied {
                    Some(request) => request,
                    None => run.request()?,
                };
                Ok(Migration::new(&self.deps, request))
            }
        }
    }

    /// Runs [`MigrationRuntime::execute`] on its own task.
    pub fn spawn(
        &self,
        run_id: String,
        supplied: Option<MigrationRequest>,
    ) -> JoinHandle<Result<ServerHandle>> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.execute(&run_id, supplied).await })
    }

    async fn set_status(&self, run_id: &str, status: RunStatus, reason: Option<&str>) -> Result<()> {
        self.storage.update_run_status(run_id, status, reason).await?;
        self.emit_status(run_id, status, reason);
        Ok(())
    }

    fn emit_status(&self, run_id: &str, status: RunStatus, reason: Option<&str>) {
        let _ = self.events.send(RunEvent::StatusChanged {
            run_id: run_id.to_string(),
            status,
            reason: reason.map(str::to_string),
        });
    }
}
