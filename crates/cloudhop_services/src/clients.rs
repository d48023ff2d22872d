use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudhop_contract::{
    FlavorHandle, ImageHandle, InstanceBuildParameters, ServerHandle, VolumeHandle,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::ControlPlaneDb;
use crate::transport::RemoteTransport;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("service call failed: {0}")]
    Api(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected service response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Image content as it streams between catalogs.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ServiceError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCreate {
    pub size: u64,
    pub display_name: Option<String>,
    pub display_description: Option<String>,
    pub volume_type: Option<String>,
    pub availability_zone: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUpdate {
    pub display_name: Option<String>,
    pub display_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadToImage {
    pub image_name: String,
    pub container_format: String,
    pub disk_format: String,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageCreate {
    pub name: String,
    pub container_format: String,
    pub disk_format: String,
    pub is_public: bool,
    pub protected: bool,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortCreate {
    pub network_id: String,
    pub mac_address: String,
    pub security_groups: Vec<String>,
    pub tenant_id: String,
    pub fixed_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub tenant_id: String,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkFilter {
    Id(String),
    Name(String),
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Creates a server scoped to `tenant`.
    async fn create_server(
        &self,
        tenant: &str,
        params: &InstanceBuildParameters,
    ) -> Result<ServerHandle, ServiceError>;

    async fn get_server(&self, server_id: &str) -> Result<ServerHandle, ServiceError>;

    async fn start_server(&self, server_id: &str) -> Result<(), ServiceError>;

    async fn stop_server(&self, server_id: &str) -> Result<(), ServiceError>;

    async fn find_flavor(&self, name: &str) -> Result<FlavorHandle, ServiceError>;

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>, ServiceError>;

    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: Option<&str>,
    ) -> Result<(), ServiceError>;

    async fn add_floating_ip(
        &self,
        server_id: &str,
        address: &str,
        fixed_address: &str,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait VolumeService: Send + Sync {
    async fn create_volume(&self, request: &VolumeCreate) -> Result<VolumeHandle, ServiceError>;

    async fn get_volume(&self, volume_id: &str) -> Result<VolumeHandle, ServiceError>;

    async fn update_volume(
        &self,
        volume_id: &str,
        update: &VolumeUpdate,
    ) -> Result<VolumeHandle, ServiceError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ServiceError>;

    async fn attach_volume(
        &self,
        volume_id: &str,
        server_id: &str,
        mountpoint: &str,
    ) -> Result<(), ServiceError>;

    async fn detach_volume(&self, volume_id: &str) -> Result<(), ServiceError>;

    async fn list_volumes(&self) -> Result<Vec<VolumeHandle>, ServiceError>;

    /// Uploads the volume contents into a new image and returns the image id.
    async fn upload_to_image(
        &self,
        volume_id: &str,
        request: &UploadToImage,
    ) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageHandle>, ServiceError>;

    async fn get_image(&self, image_id: &str) -> Result<ImageHandle, ServiceError>;

    async fn create_image(
        &self,
        request: &ImageCreate,
        data: ByteStream,
    ) -> Result<ImageHandle, ServiceError>;

    async fn delete_image(&self, image_id: &str) -> Result<(), ServiceError>;

    async fn download_image(&self, image_id: &str) -> Result<ByteStream, ServiceError>;
}

#[async_trait]
pub trait NetworkService: Send + Sync {
    async fn list_ports(&self) -> Result<Vec<Port>, ServiceError>;

    async fn create_port(&self, request: &PortCreate) -> Result<Port, ServiceError>;

    async fn delete_port(&self, port_id: &str) -> Result<(), ServiceError>;

    async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<Network>, ServiceError>;

    async fn list_subnets(&self) -> Result<Vec<Subnet>, ServiceError>;
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn tenant_id_by_name(&self, name: &str) -> Result<String, ServiceError>;
}

/// Source-cloud services the engine reads from.
#[derive(Clone)]
pub struct SourceCloud {
    pub images: Arc<dyn ImageService>,
    pub volumes: Arc<dyn VolumeService>,
}

/// Destination-cloud services the engine provisions into.
#[derive(Clone)]
pub struct DestinationCloud {
    pub compute: Arc<dyn ComputeService>,
    pub volumes: Arc<dyn VolumeService>,
    pub images: Arc<dyn ImageService>,
    pub network: Arc<dyn NetworkService>,
    pub identity: Arc<dyn IdentityService>,
    pub database: Arc<dyn ControlPlaneDb>,
}

#[derive(Clone)]
pub struct CloudServices {
    pub source: SourceCloud,
    pub destination: DestinationCloud,
    pub transport: Arc<dyn RemoteTransport>,
}
