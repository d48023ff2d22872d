use std::sync::Arc;

use cloudhop_contract::{
    ImageHandle, MigrationRequest, ServerHandle, VolumeHandle, WorkflowState,
};
use cloudhop_services::{CloudServices, CommandOutput};
use cloudhop_transfer::{
    DeviceLocator, KeyedLocks, PipelineExecutor, RemoteCommand, TransferLayout,
};
use tokio_util::sync::CancellationToken;

use crate::config::MigrationConfig;
use crate::error::WorkflowError;
use crate::image::ImageReconciler;
use crate::proxy::CopyProxy;
use crate::wait::StatusWaiter;

/// Process-wide collaborators shared by every migration.
#[derive(Clone)]
pub struct MigrationDeps {
    pub config: Arc<MigrationConfig>,
    pub services: CloudServices,
    pub locks: KeyedLocks,
    pub cancel: CancellationToken,
}

impl MigrationDeps {
    pub fn new(config: Arc<MigrationConfig>, services: CloudServices) -> Self {
        Self {
            config,
            services,
            locks: KeyedLocks::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn context(&self, state: WorkflowState) -> MigrationContext {
        let executor = Arc::new(PipelineExecutor::new(
            self.services.transport.clone(),
            self.locks.clone(),
            self.config.executor_settings(),
        ));
        MigrationContext {
            config: self.config.clone(),
            services: self.services.clone(),
            executor,
            waiter: StatusWaiter::new(self.config.wait.clone()),
            proxy: CopyProxy::new(self.config.destination.speed_limit),
            cancel: self.cancel.child_token(),
            state,
        }
    }
}

/// Mutable context of one migration, handed to each step in turn.
pub struct MigrationContext {
    pub config: Arc<MigrationConfig>,
    pub services: CloudServices,
    pub executor: Arc<PipelineExecutor>,
    pub waiter: StatusWaiter,
    pub proxy: CopyProxy,
    pub cancel: CancellationToken,
    pub state: WorkflowState,
}

impl MigrationContext {
    pub fn request(&self) -> Result<&MigrationRequest, WorkflowError> {
        self.state
            .pending_request
            .as_ref()
            .ok_or(WorkflowError::MissingRequest)
    }

    pub fn instance(&self) -> Result<&ServerHandle, WorkflowError> {
        self.state
            .created_instance_handle
            .as_ref()
            .ok_or(WorkflowError::MissingInstance)
    }

    pub fn layout(&self) -> TransferLayout {
        self.config.transfer_layout()
    }

    pub fn device_locator(&self) -> DeviceLocator {
        DeviceLocator::new(self.executor.clone(), self.config.destination.gateway.clone())
    }

    pub fn reconciler(&self) -> ImageReconciler {
        ImageReconciler::new(
            self.services.source.images.clone(),
            self.services.destination.images.clone(),
            self.proxy.clone(),
        )
    }

    pub async fn run(&self, command: RemoteCommand) -> Result<CommandOutput, WorkflowError> {
        Ok(self.executor.run_command(&command, &self.cancel).await?)
    }

    pub async fn wait_server(
        &self,
        server_id: &str,
        desired: &str,
    ) -> Result<ServerHandle, WorkflowError> {
        let compute = &self.services.destination.compute;
        self.waiter
            .wait_for(&format!("server {server_id}"), desired, &self.cancel, move || async move {
                compute.get_server(server_id).await.map(|server| server.status)
            })
            .await?;
        Ok(compute.get_server(server_id).await?)
    }

    pub async fn wait_volume(
        &self,
        volume_id: &str,
        desired: &str,
    ) -> Result<VolumeHandle, WorkflowError> {
        let volumes = &self.services.destination.volumes;
        self.waiter
            .wait_for(&format!("volume {volume_id}"), desired, &self.cancel, move || async move {
                volumes.get_volume(volume_id).await.map(|volume| volume.status)
            })
            .await?;
        Ok(volumes.get_volume(volume_id).await?)
    }

    /// Waits on an image in the source catalog.
    pub async fn wait_source_image(
        &self,
        image_id: &str,
        desired: &str,
    ) -> Result<ImageHandle, WorkflowError> {
        let images = &self.services.source.images;
        self.waiter
            .wait_for(&format!("image {image_id}"), desired, &self.cancel, move || async move {
                images.get_image(image_id).await.map(|image| image.status)
            })
            .await?;
        Ok(images.get_image(image_id).await?)
    }
}
