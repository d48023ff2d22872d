use cloudhop_contract::{STATUS_ACTIVE, STATUS_SHUTOFF};
use tracing::info;

use crate::context::MigrationContext;
use crate::error::WorkflowError;
use crate::step::Step;

/// Boots the destination instance and blocks until it is active.
pub fn create_instance() -> Step {
    Step::atomic("create_instance", |ctx| Box::pin(boot_instance(ctx)))
}

pub fn stop_instance() -> Step {
    Step::atomic("stop_instance", |ctx| Box::pin(shut_off(ctx)))
}

pub fn start_instance() -> Step {
    Step::atomic("start_instance", |ctx| Box::pin(power_on(ctx)))
}

async fn boot_instance(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    if let Some(existing) = ctx.state.created_instance_handle.clone() {
        info!(instance_id = %existing.id, "instance already created");
        let ready = ctx.wait_server(&existing.id, STATUS_ACTIVE).await?;
        ctx.state.created_instance_handle = Some(ready);
        return Ok(());
    }

    let params = ctx.state.derived_parameters.clone();
    match (&params.image, params.block_device_mapping.is_empty()) {
        (None, true) => return Err(WorkflowError::MissingImage),
        (Some(_), false) => {
            return Err(WorkflowError::InvalidState(
                "boot-from-volume instance still carries an image".to_string(),
            ))
        }
        _ => {}
    }
    let tenant = match &params.tenant_name {
        Some(tenant) => tenant.clone(),
        None => ctx.request()?.tenant_name.clone(),
    };

    let created = ctx
        .services
        .destination
        .compute
        .create_server(&tenant, &params)
        .await?;
    info!(instance_id = %created.id, tenant = %tenant, "instance requested");
    ctx.state.created_instance_handle = Some(created.clone());

    let ready = ctx.wait_server(&created.id, STATUS_ACTIVE).await?;
    ctx.state.created_instance_handle = Some(ready);
    Ok(())
}

async fn shut_off(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let instance_id = ctx.instance()?.id.clone();
    let compute = ctx.services.destination.compute.clone();
    let current = compute.get_server(&instance_id).await?;
    if current.status == STATUS_SHUTOFF {
        ctx.state.created_instance_handle = Some(current);
        return Ok(());
    }
    compute.stop_server(&instance_id).await?;
    let stopped = ctx.wait_server(&instance_id, STATUS_SHUTOFF).await?;
    ctx.state.created_instance_handle = Some(stopped);
    Ok(())
}

async fn power_on(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let instance_id = ctx.instance()?.id.clone();
    let compute = ctx.services.destination.compute.clone();
    let current = compute.get_server(&instance_id).await?;
    if current.status == STATUS_ACTIVE {
        ctx.state.created_instance_handle = Some(current);
        return Ok(());
    }
    compute.start_server(&instance_id).await?;
    let started = ctx.wait_server(&instance_id, STATUS_ACTIVE).await?;
    ctx.state.created_instance_handle = Some(started);
    Ok(())
}
