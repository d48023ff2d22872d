use cloudhop_contract::{DiskType, MigrationRequest, ServerHandle, WorkflowState};
use tracing::info;

use crate::checkpoint::CheckpointSink;
use crate::config::MigrationConfig;
use crate::context::{MigrationContext, MigrationDeps};
use crate::error::WorkflowError;
use crate::state;
use crate::step::{Runner, StepChain};
use crate::steps::disk::{
    import_delta_file, import_ephemeral_drive, merge_and_copy_to_store, merge_delta_and_image,
};
use crate::steps::instance::{create_instance, start_instance, stop_instance};
use crate::steps::network::assigning_floating;
use crate::steps::prepare::{
    delete_image_from_source_and_dest, prepare_for_boot_volume, prepare_instance,
    prepare_security_groups,
};
use crate::steps::volume::import_volumes;

/// The step chain that moves `request` from the source cloud to the
/// destination cloud under `config`.
pub fn standard_chain(config: &MigrationConfig, request: &MigrationRequest) -> StepChain {
    let boot_volume = request.boots_from_volume();
    let has_diff = request.disk.diff_path.is_some();
    let file_root = request.disk.disk_type == DiskType::RemoteFile && !boot_volume;
    let merge_first = config.destination.merge_delta_before_create && file_root && has_diff;

    let mut chain = StepChain::new();
    chain.push(prepare_security_groups());
    chain.push(prepare_instance());
    if merge_first {
        chain.push(merge_delta_and_image());
    }
    if boot_volume {
        chain.push(prepare_for_boot_volume());
    }
    chain.push(create_instance());
    if boot_volume {
        chain.push(delete_image_from_source_and_dest());
    }

    let mut imports = Vec::new();
    if file_root && !merge_first {
        if !config.ephemeral_drives.store {
            imports.push(import_delta_file());
        } else if has_diff {
            imports.push(merge_and_copy_to_store());
        }
    }
    if request.disk.ephemeral.is_some() {
        imports.push(import_ephemeral_drive());
    }
    if !request.volumes.is_empty() {
        imports.push(import_volumes(config));
    }
    if !imports.is_empty() {
        chain.push(stop_instance());
        chain.extend(imports);
        chain.push(start_instance());
    }

    if !request.floatings.is_empty() {
        chain.push(assigning_floating());
    }
    chain
}

/// One migration: its working state, the chain it runs and the steps it has
/// already finished.
pub struct Migration {
    ctx: MigrationContext,
    chain: StepChain,
    completed: Vec<String>,
}

impl Migration {
    pub fn new(deps: &MigrationDeps, request: MigrationRequest) -> Self {
        let chain = standard_chain(&deps.config, &request);
        Self {
            ctx: deps.context(WorkflowState::new(request)),
            chain,
            completed: Vec::new(),
        }
    }

    /// Picks a migration back up from a snapshot. `supplied` replaces the
    /// stored request when given.
    pub fn restore(
        deps: &MigrationDeps,
        snapshot: WorkflowState,
        supplied: Option<MigrationRequest>,
        completed: Vec<String>,
    ) -> Result<Self, WorkflowError> {
        let state = state::restore(snapshot, supplied);
        let chain = {
            let request = state
                .pending_request
                .as_ref()
                .ok_or(WorkflowError::MissingRequest)?;
            standard_chain(&deps.config, request)
        };
        info!(completed = completed.len(), "resuming migration");
        Ok(Self {
            ctx: deps.context(state),
            chain,
            completed,
        })
    }

    /// Replaces the standard chain.
    pub fn with_chain(mut self, chain: StepChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn chain(&self) -> &StepChain {
        &self.chain
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    pub fn capture(&self) -> WorkflowState {
        state::capture(&self.ctx)
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    /// Runs every step not yet completed. Stops at the first failure; the
    /// state reached so far stays available through [`Migration::capture`].
    pub async fn run(&mut self, sink: &dyn CheckpointSink) -> Result<(), WorkflowError> {
        let mut runner = Runner {
            completed: &mut self.completed,
            sink,
        };
        runner.run(self.chain.steps(), None, &mut self.ctx).await
    }

    /// Runs the remaining steps and hands back the destination instance.
    pub async fn finish(mut self, sink: &dyn CheckpointSink) -> Result<ServerHandle, WorkflowError> {
        self.run(sink).await?;
        self.ctx.instance().cloned()
    }
}
