use std::collections::BTreeMap;

use cloudhop_contract::{
    SourceVolume, VolumeHandle, VolumeRecord, WorkflowState, SOURCE_ID_KEY, STATUS_AVAILABLE,
    STATUS_IN_USE,
};
use cloudhop_services::{bootable_patch, ImageService, ServiceError, UploadToImage, VolumeCreate};
use cloudhop_transfer::{resolve, DiskSlot, Recipe, TransferError, VolumeEndpoints};
use tracing::info;

use super::ignore_missing;
use crate::config::MigrationConfig;
use crate::context::MigrationContext;
use crate::error::WorkflowError;
use crate::step::Step;

/// Volume import in the order the configuration asks for.
pub fn import_volumes(config: &MigrationConfig) -> Step {
    let children = if config.source.transfer_volumes_via_image_service {
        vec![transfer_volumes_via_image_service(), attaching_volume()]
    } else if config.attach_before_transfer() {
        vec![create_new_volume(), attaching_volume(), transfer_volume_directly()]
    } else {
        vec![create_new_volume(), transfer_volume_directly(), attaching_volume()]
    };
    Step::composite("import_volumes", children)
}

pub fn create_new_volume() -> Step {
    Step::atomic("create_new_volume", |ctx| Box::pin(create_volumes(ctx)))
}

pub fn transfer_volume_directly() -> Step {
    Step::atomic("transfer_volume_directly", |ctx| Box::pin(stream_volumes(ctx)))
}

pub fn transfer_volumes_via_image_service() -> Step {
    Step::atomic("transfer_volumes_via_image_service", |ctx| {
        Box::pin(volumes_through_images(ctx))
    })
}

/// Attaches destination volumes in request order, one at a time.
pub fn attaching_volume() -> Step {
    Step::atomic("attaching_volume", |ctx| Box::pin(attach_volumes(ctx)))
}

fn volume_create(source: &SourceVolume, image_ref: Option<String>) -> VolumeCreate {
    VolumeCreate {
        size: source.size,
        display_name: source.display_name.clone(),
        display_description: source.display_description.clone(),
        volume_type: source.volume_type.clone(),
        availability_zone: source.availability_zone.clone(),
        metadata: BTreeMap::from([(SOURCE_ID_KEY.to_string(), source.id.clone())]),
        image_ref,
    }
}

fn record_destination(state: &mut WorkflowState, source: &SourceVolume, handle: VolumeHandle) {
    match state.volume_record_mut(&source.id) {
        Some(record) => record.destination = Some(handle),
        None => state
            .created_volume_records
            .push(VolumeRecord::provisioned(source.clone(), handle)),
    }
}

fn provisioned(state: &WorkflowState, source_id: &str) -> Option<VolumeHandle> {
    state
        .volume_record(source_id)
        .and_then(|record| record.destination.clone())
}

fn settled(volume: &VolumeHandle) -> bool {
    volume.status == STATUS_AVAILABLE || volume.status == STATUS_IN_USE
}

async fn create_volumes(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let sources = ctx.request()?.volumes.clone();
    let volumes = ctx.services.destination.volumes.clone();

    for source in &sources {
        let volume_id = match provisioned(&ctx.state, &source.id) {
            Some(existing) if settled(&existing) => continue,
            Some(existing) => existing.id,
            None => {
                let created = volumes.create_volume(&volume_create(source, None)).await?;
                info!(source_id = %source.id, volume_id = %created.id, "destination volume requested");
                let id = created.id.clone();
                record_destination(&mut ctx.state, source, created);
                id
            }
        };
        let ready = ctx.wait_volume(&volume_id, STATUS_AVAILABLE).await?;
        record_destination(&mut ctx.state, source, ready);
    }
    Ok(())
}

async fn stream_volumes(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let recipe = match resolve(&ctx.config.transfer_plan())? {
        Recipe::Pipeline(recipe) => recipe,
        Recipe::ViaImageService => {
            return Err(WorkflowError::InvalidState(
                "direct transfer requested for an image-service plan".to_string(),
            ))
        }
    };
    let request = ctx.request()?.clone();
    let instance = ctx.instance()?.clone();
    let dest_compute_host = instance
        .host
        .clone()
        .ok_or_else(|| TransferError::UnplacedInstance {
            instance_id: instance.id.clone(),
        })?;
    let layout = ctx.layout();
    let locator = ctx.device_locator();

    for source in &request.volumes {
        let dest = provisioned(&ctx.state, &source.id).ok_or_else(|| {
            WorkflowError::InvalidState(format!(
                "destination volume for {} has not been created",
                source.id
            ))
        })?;
        let dest_device = if recipe.needs_dest_device() {
            Some(
                locator
                    .locate(&instance, &DiskSlot::Volume(dest.id.clone()), &ctx.cancel)
                    .await?,
            )
        } else {
            None
        };
        let endpoints = VolumeEndpoints {
            source_volume_id: source.id.clone(),
            source_host: request.disk.host.clone(),
            source_path: source.path.clone(),
            dest_volume_id: dest.id.clone(),
            dest_compute_host: dest_compute_host.clone(),
            dest_device,
        };
        let pipeline = recipe.build(&layout, &endpoints)?;
        ctx.executor.run(&pipeline, &ctx.cancel).await?;
        info!(source_id = %source.id, volume_id = %dest.id, ?recipe, "volume data transferred");
    }
    Ok(())
}

async fn volumes_through_images(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let sources = ctx.request()?.volumes.clone();
    let source_cloud = ctx.services.source.clone();
    let destination = ctx.services.destination.clone();

    for source in &sources {
        let staging = format!("volume-{}-image", source.id);
        let ready = match provisioned(&ctx.state, &source.id) {
            Some(existing) if settled(&existing) => existing,
            // Created by an interrupted attempt: wait for it rather than copy again.
            Some(existing) => ctx.wait_volume(&existing.id, STATUS_AVAILABLE).await?,
            None => {
                let (image_id, checksum) = match &source.image {
                    Some(image) => (image.id.clone(), image.checksum.clone()),
                    None => {
                        let image_id = source_cloud
                            .volumes
                            .upload_to_image(
                                &source.id,
                                &UploadToImage {
                                    image_name: staging.clone(),
                                    container_format: "bare".to_string(),
                                    disk_format: "qcow2".to_string(),
                                    force: true,
                                },
                            )
                            .await?;
                        let uploaded = ctx.wait_source_image(&image_id, "active").await?;
                        (image_id, uploaded.checksum.unwrap_or_default())
                    }
                };

                let copied = ctx
                    .reconciler()
                    .copy_image(&checksum, &image_id, &staging)
                    .await?;
                let created = destination
                    .volumes
                    .create_volume(&volume_create(source, Some(copied.id.clone())))
                    .await?;
                let volume_id = created.id.clone();
                record_destination(&mut ctx.state, source, created);
                ctx.wait_volume(&volume_id, STATUS_AVAILABLE).await?
            }
        };
        let volume_id = ready.id.clone();
        record_destination(&mut ctx.state, source, ready);
        destination
            .database
            .execute(&bootable_patch(&volume_id, source.bootable))
            .await?;

        remove_images_named(destination.images.as_ref(), &staging).await?;
        remove_images_named(source_cloud.images.as_ref(), &staging).await?;
        if let Some(image) = &source.image {
            ignore_missing(source_cloud.images.delete_image(&image.id).await)?;
        }
        info!(source_id = %source.id, volume_id = %volume_id, "volume imported through image service");
    }
    Ok(())
}

/// Removes every image called `name`, including leftovers of earlier attempts.
async fn remove_images_named(images: &dyn ImageService, name: &str) -> Result<(), ServiceError> {
    for image in images.list_images().await? {
        if image.name == name {
            ignore_missing(images.delete_image(&image.id).await)?;
        }
    }
    Ok(())
}

async fn attach_volumes(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let sources = ctx.request()?.volumes.clone();
    let instance_id = ctx.instance()?.id.clone();
    let compute = ctx.services.destination.compute.clone();
    let volumes = ctx.services.destination.volumes.clone();

    for source in &sources {
        let dest = provisioned(&ctx.state, &source.id).ok_or_else(|| {
            WorkflowError::InvalidState(format!(
                "destination volume for {} has not been created",
                source.id
            ))
        })?;
        let current = volumes.get_volume(&dest.id).await?;
        if current.status == STATUS_IN_USE {
            record_destination(&mut ctx.state, source, current);
            continue;
        }
        compute
            .attach_volume(&instance_id, &dest.id, source.device.as_deref())
            .await?;
        let attached = ctx.wait_volume(&dest.id, STATUS_IN_USE).await?;
        info!(source_id = %source.id, volume_id = %dest.id, "volume attached");
        record_destination(&mut ctx.state, source, attached);
    }
    Ok(())
}
