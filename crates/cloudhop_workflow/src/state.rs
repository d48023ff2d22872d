use cloudhop_contract::{MigrationRequest, WorkflowState};

use crate::context::MigrationContext;

/// Snapshot of everything a migration has produced so far.
pub fn capture(ctx: &MigrationContext) -> WorkflowState {
    ctx.state.clone()
}

/// Rebuilds working state from a snapshot. Everything already created on the
/// destination comes from the snapshot; a request supplied by the caller
/// replaces the stored one.
pub fn restore(snapshot: WorkflowState, supplied: Option<MigrationRequest>) -> WorkflowState {
    WorkflowState {
        pending_request: supplied.or(snapshot.pending_request),
        derived_parameters: snapshot.derived_parameters,
        created_instance_handle: snapshot.created_instance_handle,
        created_volume_records: snapshot.created_volume_records,
    }
}
