use std::collections::BTreeMap;

use cloudhop_contract::{BlockDeviceMapping, DiskType, ImageRef, MigrationRequest};
use tracing::info;

use super::ignore_missing;
use super::network::prepare_nics;
use crate::context::MigrationContext;
use crate::error::WorkflowError;
use crate::step::Step;

pub fn prepare_name() -> Step {
    Step::atomic("prepare_name", |ctx| Box::pin(derive_name(ctx)))
}

pub fn prepare_tenant_name() -> Step {
    Step::atomic("prepare_tenant_name", |ctx| Box::pin(derive_tenant_name(ctx)))
}

pub fn prepare_image_from_base() -> Step {
    Step::atomic("prepare_image_from_base", |ctx| Box::pin(image_from_base(ctx)))
}

pub fn prepare_image_from_diff_path_if_ephemeral_store() -> Step {
    Step::atomic("prepare_image_from_diff_path_if_ephemeral_store", |ctx| {
        Box::pin(image_from_store_diff(ctx))
    })
}

pub fn prepare_image() -> Step {
    Step::composite(
        "prepare_image",
        vec![
            prepare_image_from_base(),
            prepare_image_from_diff_path_if_ephemeral_store(),
        ],
    )
}

pub fn prepare_flavor() -> Step {
    Step::atomic("prepare_flavor", |ctx| Box::pin(resolve_flavor(ctx)))
}

pub fn prepare_metadata() -> Step {
    Step::atomic("prepare_metadata", |ctx| Box::pin(derive_metadata(ctx)))
}

pub fn prepare_key_name() -> Step {
    Step::atomic("prepare_key_name", |ctx| Box::pin(derive_key_name(ctx)))
}

pub fn prepare_config_drive() -> Step {
    Step::atomic("prepare_config_drive", |ctx| Box::pin(derive_config_drive(ctx)))
}

pub fn prepare_disk_config() -> Step {
    Step::atomic("prepare_disk_config", |ctx| Box::pin(derive_disk_config(ctx)))
}

pub fn prepare_security_groups() -> Step {
    Step::atomic("prepare_security_groups", |ctx| {
        Box::pin(derive_security_groups(ctx))
    })
}

/// Every instance attribute, in the order the destination needs them.
pub fn prepare_instance() -> Step {
    Step::composite(
        "prepare_instance",
        vec![
            prepare_name(),
            prepare_tenant_name(),
            prepare_image(),
            prepare_flavor(),
            prepare_metadata(),
            prepare_key_name(),
            prepare_config_drive(),
            prepare_disk_config(),
            prepare_nics(),
        ],
    )
}

/// Swaps the prepared image for a root volume built from it.
pub fn prepare_for_boot_volume() -> Step {
    Step::atomic("prepare_for_boot_volume", |ctx| Box::pin(boot_from_volume(ctx)))
}

/// Removes the temporary boot image from both catalogs once the root volume
/// exists.
pub fn delete_image_from_source_and_dest() -> Step {
    Step::atomic("delete_image_from_source_and_dest", |ctx| {
        Box::pin(delete_boot_image(ctx))
    })
}

async fn derive_name(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let name = ctx.request()?.name.clone();
    ctx.state.derived_parameters.name = Some(name);
    Ok(())
}

async fn derive_tenant_name(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.tenant_name.clone();
    let tenant = ctx
        .config
        .import_rules
        .resolve("tenant_name", Some(requested))?;
    ctx.state.derived_parameters.tenant_name = tenant;
    Ok(())
}

/// Overlay image of a store-backed root disk, when the exporter uploaded one.
fn store_diff_image(request: &MigrationRequest) -> Option<&ImageRef> {
    match request.disk.disk_type {
        DiskType::DistributedStore => request.disk.diff_image.as_ref(),
        DiskType::RemoteFile => None,
    }
}

async fn image_from_base(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let request = ctx.request()?.clone();
    if store_diff_image(&request).is_some() {
        info!("root disk overlay image takes the place of the base image");
        return Ok(());
    }
    let Some(image) = request.image else {
        return Ok(());
    };
    let prepared = ctx.reconciler().ensure_image(&image.checksum, &image).await?;
    ctx.state.derived_parameters.image = Some(prepared);
    Ok(())
}

async fn image_from_store_diff(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let request = ctx.request()?.clone();
    let Some(diff) = store_diff_image(&request) else {
        return Ok(());
    };
    let prepared = ctx.reconciler().ensure_image(&diff.checksum, diff).await?;
    ctx.state.derived_parameters.image = Some(prepared);
    ignore_missing(ctx.services.source.images.delete_image(&diff.id).await)?;
    Ok(())
}

async fn resolve_flavor(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.flavor.clone();
    let Some(name) = ctx
        .config
        .import_rules
        .resolve::<String>("flavor", requested)?
    else {
        return Err(WorkflowError::FlavorNotFound("<unset>".to_string()));
    };
    let flavor = match ctx.services.destination.compute.find_flavor(&name).await {
        Ok(flavor) => flavor,
        Err(err) if err.is_not_found() => return Err(WorkflowError::FlavorNotFound(name)),
        Err(err) => return Err(err.into()),
    };
    ctx.state.derived_parameters.flavor = Some(flavor);
    Ok(())
}

async fn derive_metadata(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.metadata.clone();
    let metadata = ctx
        .config
        .import_rules
        .resolve::<BTreeMap<String, String>>("metadata", requested)?;
    ctx.state.derived_parameters.metadata = metadata.unwrap_or_default();
    Ok(())
}

async fn derive_key_name(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.key.as_ref().map(|key| key.name.clone());
    let key_name = ctx.config.import_rules.resolve("key_name", requested)?;
    ctx.state.derived_parameters.key_name = key_name;
    Ok(())
}

async fn derive_config_drive(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.config_drive;
    let config_drive = ctx.config.import_rules.resolve("config_drive", requested)?;
    ctx.state.derived_parameters.config_drive = config_drive;
    Ok(())
}

async fn derive_disk_config(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.disk_config.clone();
    let disk_config = ctx.config.import_rules.resolve("disk_config", requested)?;
    ctx.state.derived_parameters.disk_config = disk_config;
    Ok(())
}

async fn derive_security_groups(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let requested = ctx.request()?.security_groups.clone();
    let groups = ctx
        .config
        .import_rules
        .resolve::<Vec<String>>("security_groups", requested)?;
    ctx.state.derived_parameters.security_groups = groups.unwrap_or_default();
    Ok(())
}

async fn boot_from_volume(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let size = ctx
        .request()?
        .boot_volume_size
        .ok_or_else(|| WorkflowError::InvalidState("boot volume size is not set".to_string()))?;
    let derived = &mut ctx.state.derived_parameters;
    if derived.image.is_none() && !derived.block_device_mapping.is_empty() {
        return Ok(());
    }
    let image = derived.image.take().ok_or(WorkflowError::MissingImage)?;
    derived.block_device_mapping = vec![BlockDeviceMapping::boot_volume_from_image(&image.id, size)];
    info!(image_id = %image.id, size, "instance will boot from volume");
    Ok(())
}

async fn delete_boot_image(ctx: &mut MigrationContext) -> Result<(), WorkflowError> {
    let boot_image = ctx
        .state
        .derived_parameters
        .block_device_mapping
        .first()
        .map(|mapping| mapping.uuid.clone());
    if let Some(image_id) = boot_image {
        ignore_missing(ctx.services.destination.images.delete_image(&image_id).await)?;
    }
    if let Some(image) = ctx.request()?.image.clone() {
        ignore_missing(ctx.services.source.images.delete_image(&image.id).await)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cloudhop_contract::{DiskLocation, DiskType, ImageRef, MigrationRequest};

    use super::store_diff_image;

    fn request() -> MigrationRequest {
        MigrationRequest {
            name: "db-01".to_string(),
            tenant_name: "ops".to_string(),
            flavor: None,
            image: None,
            metadata: None,
            key: None,
            config_drive: None,
            disk_config: None,
            security_groups: None,
            networks: Vec::new(),
            volumes: Vec::new(),
            floatings: Vec::new(),
            disk: DiskLocation {
                host: "src-compute".to_string(),
                path: "/var/lib/nova/instances/abc/disk".to_string(),
                disk_type: DiskType::RemoteFile,
                diff_path: None,
                diff_image: Some(ImageRef {
                    id: "diff".to_string(),
                    checksum: "c".to_string(),
                    name: "diff".to_string(),
                }),
                ephemeral: None,
            },
            boot_volume_size: Some(20),
        }
    }

    #[test]
    fn diff_image_only_counts_for_store_disks() {
        let mut request = request();
        assert!(store_diff_image(&request).is_none());
        request.disk.disk_type = DiskType::DistributedStore;
        assert_eq!(store_diff_image(&request).map(|image| image.id.as_str()), Some("diff"));
    }
}
