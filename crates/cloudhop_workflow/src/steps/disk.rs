use cloudhop_contract::{DiskType, ServerHandle};
use cloudhop_transfer::commands::{
    backing_file_query, commit, convert_base_to_raw, convert_into_store, fresh_dir,
    parse_backing_file, rebase, remove_path, remove_store_image,
};
use cloudhop_transfer::{DiskSlot, ImageCli, Pipeline, RemoteCommand, TransferError};
use tracing::info;

use crate::context::MigrationContext;
use crate::error::WorkflowError;
use crate::step::Step;

/// Copies the root disk overlay onto the destination root disk.
pub fn import_delta_file() -> Step {
    Step::atomic("import_delta_file", |ctx| Box::pin(copy_root_disk(ctx)))
}

pub fn import_ephemeral_drive() -> Step {
    Step::atomic("import_ephemeral_drive", |ctx| Box::pin(copy_ephemeral(ctx)))
}

/// Folds the root disk overlay into its base image and registers the result
/// as the image the instance boots from.
pub fn merge_delta_and_image() -> Step {
    Step::atomic("merge_delta_and_image", |ctx| Box::pin(merge_into_image(ctx)))
}

/// Rebuilds the root disk in the destination compute pool from the overlay
/// and its base.
pub fn merge_and_copy_to_store() -> Step {
    Step::atomic("merge_and_copy_to_store", |ctx| Box::pin(merge_into_store(ctx)))
}

fn compute_host(instance: &ServerHandle) -> Result<String, TransferError> {
    instance
        .host
        .clone()
        .ok_or_else(|| TransferError::UnplacedInstance {
            instance_id: instance.id.clone(),
        })
}

fn image_cli(ctx: &MigrationContext) -> Result<ImageCli, WorkflowError> {
    ctx.config
        .destination
        .image_cli
        .clone()
        .ok_or_else(|| WorkflowError::InvalidState("destination image_cli is not configured".to_string()))
}

async fn run_pipeline(ctx: &MigrationContext, pipeline: &Pipeline) -> Result<(), WorkflowError> {
    Ok(ctx.executor.run(pipeline, &ctx.cancel).await?)
}

async fn copy_root_disk(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let disk = ctx.request()?.disk.clone();
    let instance = ctx.instance()?.clone();
    let source_path = disk.diff_path.clone().unwrap_or(disk.path.clone());

    let dest_path = ctx
        .device_locator()
        .locate(&instance, &DiskSlot::Root, &ctx.cancel)
        .await?;
    let pipeline = ctx.layout().file_copy(
        &disk.host,
        &source_path,
        &compute_host(&instance)?,
        &dest_path,
        ctx.config.transfer_file.compression(),
    );
    run_pipeline(ctx, &pipeline).await?;
    info!(source = %source_path, dest = %dest_path, "root disk copied");
    Ok(())
}

async fn copy_ephemeral(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let disk = ctx.request()?.disk.clone();
    let Some(ephemeral) = disk.ephemeral.clone() else {
        info!("instance has no ephemeral disk");
        return Ok(());
    };
    let instance = ctx.instance()?.clone();
    let compression = ctx.config.transfer_ephemeral.compression();
    let source_is_store = disk.disk_type == DiskType::DistributedStore;

    if ctx.config.ephemeral_drives.store {
        let pipeline = ctx.layout().ephemeral_to_store(
            &disk.host,
            &ephemeral,
            &instance.id,
            source_is_store,
            compression,
        );
        return run_pipeline(ctx, &pipeline).await;
    }

    let host = compute_host(&instance)?;
    let gateway = ctx.config.destination.gateway.clone();
    let dest_path = ctx
        .device_locator()
        .locate(&instance, &DiskSlot::Ephemeral, &ctx.cancel)
        .await?;
    let copy = ctx
        .layout()
        .file_copy(&disk.host, &ephemeral, &host, &dest_path, compression);

    if !source_is_store {
        return run_pipeline(ctx, &copy).await;
    }

    let query = ctx
        .run(RemoteCommand::via(gateway.clone(), &host, &backing_file_query(&dest_path)).tolerant())
        .await?;
    let backing = parse_backing_file(&query.output);
    ctx.run(RemoteCommand::via(gateway.clone(), &host, &remove_path(&dest_path)))
        .await?;
    run_pipeline(ctx, &copy).await?;
    if let Some(backing) = backing {
        ctx.run(RemoteCommand::via(gateway, &host, &rebase(&backing, &dest_path)))
            .await?;
        info!(backing = %backing, "ephemeral disk rebased");
    }
    Ok(())
}

async fn merge_into_image(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let disk = ctx.request()?.disk.clone();
    let cli = image_cli(ctx)?;
    let image = ctx
        .state
        .derived_parameters
        .image
        .clone()
        .ok_or(WorkflowError::MissingImage)?;
    let diff_path = disk
        .diff_path
        .clone()
        .ok_or_else(|| WorkflowError::InvalidState("root disk has no overlay to merge".to_string()))?;
    let gateway = ctx.config.destination.gateway.clone();
    let workdir = format!("{}/{}", ctx.config.destination.temp_dir, image.id);
    let disk_file = format!("{workdir}/disk");
    let base_file = format!("{workdir}/baseimage");

    ctx.run(RemoteCommand::on(gateway.clone(), fresh_dir(&workdir))).await?;
    let stage = ctx
        .layout()
        .stage_on_gateway(&disk.host, &diff_path, &disk_file);
    run_pipeline(ctx, &stage).await?;
    ctx.run(RemoteCommand::on(gateway.clone(), cli.download(&image.id, &base_file)))
        .await?;
    ctx.run(RemoteCommand::on(gateway.clone(), rebase(&base_file, &disk_file)))
        .await?;
    ctx.run(RemoteCommand::on(gateway.clone(), commit(&workdir))).await?;

    let mut disk_format = image.disk_format.clone();
    if cli.convert_to_raw && disk_format != "raw" {
        ctx.run(RemoteCommand::on(gateway.clone(), convert_base_to_raw(&workdir, &disk_format)))
            .await?;
        disk_format = "raw".to_string();
    }

    let uploaded = ctx
        .run(RemoteCommand::on(
            gateway.clone(),
            cli.upload(&format!("new{}", image.name), &disk_format, &base_file),
        ))
        .await?;
    let merged_id = ImageCli::parse_created_id(&uploaded.output).ok_or_else(|| {
        WorkflowError::InvalidState("image upload did not report the new image id".to_string())
    })?;
    let merged = ctx.services.destination.images.get_image(&merged_id).await?;
    ctx.run(RemoteCommand::on(gateway, remove_path(&workdir))).await?;

    info!(base = %image.id, merged = %merged.id, "overlay merged into new image");
    ctx.state.derived_parameters.image = Some(merged);
    Ok(())
}

async fn merge_into_store(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let request = ctx.request()?.clone();
    let disk = request.disk;
    let instance = ctx.instance()?.clone();
    let diff_path = disk
        .diff_path
        .clone()
        .ok_or_else(|| WorkflowError::InvalidState("root disk has no overlay to merge".to_string()))?;
    let gateway = ctx.config.destination.gateway.clone();
    let source_gateway = ctx.config.source.gateway.clone();
    let pool = ctx.config.destination.compute_pool.clone();
    let workdir = format!("{}/{}", ctx.config.destination.temp_dir, instance.id);
    let disk_file = format!("{workdir}/disk");
    let base_file = format!("{workdir}/baseimage");
    let store_image = format!("{}_disk", instance.id);

    ctx.run(RemoteCommand::on(gateway.clone(), fresh_dir(&workdir))).await?;
    let stage = ctx
        .layout()
        .stage_on_gateway(&disk.host, &diff_path, &disk_file);
    run_pipeline(ctx, &stage).await?;

    let base_image = match &ctx.state.derived_parameters.image {
        Some(image) => match ctx.services.destination.images.get_image(&image.id).await {
            Ok(found) if found.status != "deleted" => Some(found),
            Ok(_) => None,
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        },
        None => None,
    };
    match (base_image, ctx.config.destination.image_cli.clone()) {
        (Some(image), Some(cli)) => {
            ctx.run(RemoteCommand::on(gateway.clone(), cli.download(&image.id, &base_file)))
                .await?;
        }
        _ => {
            let query = ctx
                .run(RemoteCommand::via(
                    source_gateway,
                    &disk.host,
                    &backing_file_query(&diff_path),
                ))
                .await?;
            let backing = parse_backing_file(&query.output).ok_or_else(|| {
                WorkflowError::InvalidState(format!("{diff_path} has no backing file"))
            })?;
            info!(backing = %backing, "base image gone, copying backing file instead");
            let stage = ctx
                .layout()
                .stage_on_gateway(&disk.host, &backing, &base_file);
            run_pipeline(ctx, &stage).await?;
        }
    }

    ctx.run(RemoteCommand::on(gateway.clone(), rebase(&base_file, &disk_file)))
        .await?;
    ctx.run(RemoteCommand::on(gateway.clone(), remove_store_image(&pool, &store_image)).tolerant())
        .await?;
    ctx.run(RemoteCommand::on(
        gateway.clone(),
        convert_into_store(&workdir, &pool, &store_image),
    ))
    .await?;
    ctx.run(RemoteCommand::on(gateway, remove_path(&workdir))).await?;
    info!(pool = %pool, image = %store_image, "root disk written to store");
    Ok(())
}
