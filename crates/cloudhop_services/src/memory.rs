use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cloudhop_contract::{
    FlavorHandle, ImageHandle, InstanceBuildParameters, ServerHandle, VolumeHandle,
    STATUS_ACTIVE, STATUS_AVAILABLE, STATUS_IN_USE, STATUS_SHUTOFF,
};
use futures::StreamExt;
use tracing::info;

use crate::clients::{
    ByteStream, ComputeService, IdentityService, ImageCreate, ImageService, Network,
    NetworkFilter, NetworkService, Port, PortCreate, SecurityGroup, ServiceError, Subnet,
    UploadToImage, VolumeCreate, VolumeService, VolumeUpdate,
};
use crate::database::ControlPlaneDb;

const CHUNK_SIZE: usize = 4;

#[derive(Debug, Clone)]
struct Tracked<T> {
    value: T,
    transitional: String,
    target: String,
    pending_polls: usize,
}

impl<T> Tracked<T> {
    fn settled(value: T, status: &str) -> Self {
        Self {
            value,
            transitional: status.to_string(),
            target: status.to_string(),
            pending_polls: 0,
        }
    }

    fn move_to(&mut self, transitional: &str, target: &str, lag: usize) {
        self.transitional = transitional.to_string();
        self.target = target.to_string();
        self.pending_polls = lag;
    }

    fn poll(&mut self) -> String {
        if self.pending_polls > 0 {
            self.pending_polls -= 1;
            self.transitional.clone()
        } else {
            self.target.clone()
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    counter: u64,
    status_lag: usize,
    corrupt_uploads: bool,
    compute_host: String,
    calls: Vec<String>,
    servers: BTreeMap<String, Tracked<ServerHandle>>,
    flavors: Vec<FlavorHandle>,
    security_groups: Vec<SecurityGroup>,
    volumes: BTreeMap<String, Tracked<VolumeHandle>>,
    images: BTreeMap<String, (ImageHandle, Vec<u8>)>,
    ports: Vec<(Port, Option<String>)>,
    networks: Vec<Network>,
    subnets: Vec<Subnet>,
    tenants: BTreeMap<String, String>,
    statements: Vec<String>,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{}", self.counter)
    }

    fn record(&mut self, call: String) {
        self.calls.push(call);
    }
}

/// A whole cloud held in memory. Stands in for real service clients in dry
/// runs and tests; resource status changes can be made to lag behind
/// requests so waits are exercised.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    inner: Mutex<Inner>,
}

/// Content fingerprint used as the image checksum by [`InMemoryCloud`].
pub fn content_checksum(content: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl InMemoryCloud {
    pub fn new() -> Self {
        let cloud = Self::default();
        if let Ok(mut inner) = cloud.inner.lock() {
            inner.compute_host = "compute-1".to_string();
        }
        cloud
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ServiceError> {
        self.inner
            .lock()
            .map_err(|_| ServiceError::Api("in-memory cloud state poisoned".to_string()))
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        match self.inner.lock() {
            Ok(mut inner) => f(&mut inner),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Number of status polls that report a transitional state after each change.
    pub fn set_status_lag(&self, polls: usize) {
        self.with(|inner| inner.status_lag = polls);
    }

    /// Makes every created image record a checksum that differs from its content.
    pub fn corrupt_uploads(&self, corrupt: bool) {
        self.with(|inner| inner.corrupt_uploads = corrupt);
    }

    pub fn set_compute_host(&self, host: &str) {
        self.with(|inner| inner.compute_host = host.to_string());
    }

    pub fn add_flavor(&self, id: &str, name: &str) {
        self.with(|inner| {
            inner.flavors.push(FlavorHandle {
                id: id.to_string(),
                name: name.to_string(),
            })
        });
    }

    pub fn add_security_group(&self, id: &str, name: &str) {
        self.with(|inner| {
            inner.security_groups.push(SecurityGroup {
                id: id.to_string(),
                name: name.to_string(),
            })
        });
    }

    pub fn add_tenant(&self, name: &str, id: &str) {
        self.with(|inner| {
            inner.tenants.insert(name.to_string(), id.to_string());
        });
    }

    pub fn add_network(&self, id: &str, name: &str) {
        self.with(|inner| {
            inner.networks.push(Network {
                id: id.to_string(),
                name: name.to_string(),
            })
        });
    }

    pub fn add_subnet(&self, id: &str, network_id: &str, tenant_id: &str, cidr: &str) {
        self.with(|inner| {
            inner.subnets.push(Subnet {
                id: id.to_string(),
                network_id: network_id.to_string(),
                tenant_id: tenant_id.to_string(),
                cidr: cidr.to_string(),
            })
        });
    }

    pub fn add_port(&self, id: &str, network_id: &str, mac_address: &str) {
        self.with(|inner| {
            inner.ports.push((
                Port {
                    id: id.to_string(),
                    network_id: network_id.to_string(),
                    mac_address: mac_address.to_string(),
                },
                None,
            ))
        });
    }

    /// Seeds an active image whose checksum matches `content`.
    pub fn add_image(&self, id: &str, name: &str, content: &[u8]) -> ImageHandle {
        let handle = ImageHandle {
            id: id.to_string(),
            name: name.to_string(),
            checksum: Some(content_checksum(content)),
            status: "active".to_string(),
            disk_format: "qcow2".to_string(),
            container_format: "bare".to_string(),
            size: Some(content.len() as u64),
            is_public: false,
            protected: false,
        };
        self.with(|inner| {
            inner
                .images
                .insert(id.to_string(), (handle.clone(), content.to_vec()))
        });
        handle
    }

    pub fn add_volume(&self, volume: VolumeHandle) {
        let status = volume.status.clone();
        self.with(|inner| {
            inner
                .volumes
                .insert(volume.id.clone(), Tracked::settled(volume, &status))
        });
    }

    pub fn add_server(&self, server: ServerHandle) {
        let status = server.status.clone();
        self.with(|inner| {
            inner
                .servers
                .insert(server.id.clone(), Tracked::settled(server, &status))
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|inner| inner.calls.clone())
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub fn images(&self) -> Vec<ImageHandle> {
        self.with(|inner| inner.images.values().map(|(h, _)| h.clone()).collect())
    }

    pub fn volumes(&self) -> Vec<VolumeHandle> {
        self.with(|inner| inner.volumes.values().map(|t| t.value.clone()).collect())
    }

    pub fn ports(&self) -> Vec<Port> {
        self.with(|inner| inner.ports.iter().map(|(p, _)| p.clone()).collect())
    }

    pub fn statements(&self) -> Vec<String> {
        self.with(|inner| inner.statements.clone())
    }
}

#[async_trait]
impl ComputeService for InMemoryCloud {
    async fn create_server(
        &self,
        tenant: &str,
        params: &InstanceBuildParameters,
    ) -> Result<ServerHandle, ServiceError> {
        let mut inner = self.lock()?;
        let id = inner.next_id("srv");
        let name = params.name.clone().unwrap_or_else(|| id.clone());
        inner.record(format!("create_server {tenant} {name}"));

        let mut networks: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for nic in &params.nics {
            let net_name = inner
                .networks
                .iter()
                .find(|net| net.id == nic.net_id)
                .map(|net| net.name.clone())
                .unwrap_or_else(|| nic.net_id.clone());
            let address = inner
                .ports
                .iter()
                .find(|(port, _)| port.id == nic.port_id)
                .and_then(|(_, ip)| ip.clone())
                .unwrap_or_else(|| format!("10.0.0.{}", networks.len() + 10));
            networks.entry(net_name).or_default().push(address);
        }

        let server = ServerHandle {
            id: id.clone(),
            name,
            status: STATUS_ACTIVE.to_string(),
            host: Some(inner.compute_host.clone()),
            instance_name: Some(format!("instance-{:08x}", inner.counter)),
            networks,
        };
        let lag = inner.status_lag;
        let mut tracked = Tracked::settled(server.clone(), STATUS_ACTIVE);
        tracked.move_to("BUILD", STATUS_ACTIVE, lag);
        inner.servers.insert(id, tracked);
        Ok(ServerHandle {
            status: "BUILD".to_string(),
            ..server
        })
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerHandle, ServiceError> {
        let mut inner = self.lock()?;
        let tracked = inner
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ServiceError::not_found("server", server_id))?;
        let status = tracked.poll();
        tracked.value.status = status;
        Ok(tracked.value.clone())
    }

    async fn start_server(&self, server_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("start_server {server_id}"));
        let lag = inner.status_lag;
        let tracked = inner
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ServiceError::not_found("server", server_id))?;
        tracked.move_to(STATUS_SHUTOFF, STATUS_ACTIVE, lag);
        Ok(())
    }

    async fn stop_server(&self, server_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("stop_server {server_id}"));
        let lag = inner.status_lag;
        let tracked = inner
            .servers
            .get_mut(server_id)
            .ok_or_else(|| ServiceError::not_found("server", server_id))?;
        tracked.move_to(STATUS_ACTIVE, STATUS_SHUTOFF, lag);
        Ok(())
    }

    async fn find_flavor(&self, name: &str) -> Result<FlavorHandle, ServiceError> {
        let inner = self.lock()?;
        inner
            .flavors
            .iter()
            .find(|flavor| flavor.name == name)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("flavor", name))
    }

    async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>, ServiceError> {
        Ok(self.lock()?.security_groups.clone())
    }

    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        device: Option<&str>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!(
            "attach_volume {server_id} {volume_id} {}",
            device.unwrap_or("auto")
        ));
        let lag = inner.status_lag;
        let tracked = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ServiceError::not_found("volume", volume_id))?;
        tracked.move_to("attaching", STATUS_IN_USE, lag);
        Ok(())
    }

    async fn add_floating_ip(
        &self,
        server_id: &str,
        address: &str,
        fixed_address: &str,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("add_floating_ip {server_id} {address} {fixed_address}"));
        Ok(())
    }
}

#[async_trait]
impl VolumeService for InMemoryCloud {
    async fn create_volume(&self, request: &VolumeCreate) -> Result<VolumeHandle, ServiceError> {
        let mut inner = self.lock()?;
        let id = inner.next_id("vol");
        inner.record(format!(
            "create_volume {id} size={} image={}",
            request.size,
            request.image_ref.as_deref().unwrap_or("-")
        ));
        if let Some(image_ref) = &request.image_ref {
            if !inner.images.contains_key(image_ref) {
                return Err(ServiceError::not_found("image", image_ref.clone()));
            }
        }
        let volume = VolumeHandle {
            id: id.clone(),
            size: request.size,
            display_name: request.display_name.clone(),
            status: "creating".to_string(),
            bootable: false,
            metadata: request.metadata.clone(),
        };
        let lag = inner.status_lag;
        let mut tracked = Tracked::settled(volume.clone(), STATUS_AVAILABLE);
        tracked.move_to("creating", STATUS_AVAILABLE, lag);
        inner.volumes.insert(id, tracked);
        Ok(volume)
    }

    async fn get_volume(&self, volume_id: &str) -> Result<VolumeHandle, ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("get_volume {volume_id}"));
        let tracked = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ServiceError::not_found("volume", volume_id))?;
        let status = tracked.poll();
        tracked.value.status = status;
        Ok(tracked.value.clone())
    }

    async fn update_volume(
        &self,
        volume_id: &str,
        update: &VolumeUpdate,
    ) -> Result<VolumeHandle, ServiceError> {
        let mut inner = self.lock()?;
        let tracked = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ServiceError::not_found("volume", volume_id))?;
        if let Some(name) = &update.display_name {
            tracked.value.display_name = Some(name.clone());
        }
        Ok(tracked.value.clone())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("delete_volume {volume_id}"));
        inner
            .volumes
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found("volume", volume_id))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        server_id: &str,
        mountpoint: &str,
    ) -> Result<(), ServiceError> {
        ComputeService::attach_volume(self, server_id, volume_id, Some(mountpoint)).await
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("detach_volume {volume_id}"));
        let lag = inner.status_lag;
        let tracked = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ServiceError::not_found("volume", volume_id))?;
        tracked.move_to("detaching", STATUS_AVAILABLE, lag);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeHandle>, ServiceError> {
        Ok(self.volumes())
    }

    async fn upload_to_image(
        &self,
        volume_id: &str,
        request: &UploadToImage,
    ) -> Result<String, ServiceError> {
        let mut inner = self.lock()?;
        if !inner.volumes.contains_key(volume_id) {
            return Err(ServiceError::not_found("volume", volume_id));
        }
        let id = inner.next_id("img");
        inner.record(format!("upload_to_image {volume_id} {id}"));
        let content = format!("volume-content:{volume_id}").into_bytes();
        let handle = ImageHandle {
            id: id.clone(),
            name: request.image_name.clone(),
            checksum: Some(content_checksum(&content)),
            status: "active".to_string(),
            disk_format: request.disk_format.clone(),
            container_format: request.container_format.clone(),
            size: Some(content.len() as u64),
            is_public: false,
            protected: false,
        };
        inner.images.insert(id.clone(), (handle, content));
        Ok(id)
    }
}

#[async_trait]
impl ImageService for InMemoryCloud {
    async fn list_images(&self) -> Result<Vec<ImageHandle>, ServiceError> {
        let mut inner = self.lock()?;
        inner.record("list_images".to_string());
        Ok(inner.images.values().map(|(h, _)| h.clone()).collect())
    }

    async fn get_image(&self, image_id: &str) -> Result<ImageHandle, ServiceError> {
        let inner = self.lock()?;
        inner
            .images
            .get(image_id)
            .map(|(h, _)| h.clone())
            .ok_or_else(|| ServiceError::not_found("image", image_id))
    }

    async fn create_image(
        &self,
        request: &ImageCreate,
        mut data: ByteStream,
    ) -> Result<ImageHandle, ServiceError> {
        let mut content = Vec::new();
        while let Some(chunk) = data.next().await {
            content.extend_from_slice(&chunk?);
        }

        let mut inner = self.lock()?;
        let id = inner.next_id("img");
        inner.record(format!("create_image {id} {}", request.name));
        let mut checksum = content_checksum(&content);
        if inner.corrupt_uploads {
            let mut tampered = content.clone();
            tampered.push(b'!');
            checksum = content_checksum(&tampered);
        }
        let handle = ImageHandle {
            id: id.clone(),
            name: request.name.clone(),
            checksum: Some(checksum),
            status: "active".to_string(),
            disk_format: request.disk_format.clone(),
            container_format: request.container_format.clone(),
            size: Some(content.len() as u64),
            is_public: request.is_public,
            protected: request.protected,
        };
        info!(image_id = %id, bytes = content.len(), "in-memory image stored");
        inner.images.insert(id, (handle.clone(), content));
        Ok(handle)
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("delete_image {image_id}"));
        inner
            .images
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found("image", image_id))
    }

    async fn download_image(&self, image_id: &str) -> Result<ByteStream, ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("download_image {image_id}"));
        let content = inner
            .images
            .get(image_id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ServiceError::not_found("image", image_id))?;
        let chunks: Vec<Result<Vec<u8>, ServiceError>> = content
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

#[async_trait]
impl NetworkService for InMemoryCloud {
    async fn list_ports(&self) -> Result<Vec<Port>, ServiceError> {
        Ok(self.ports())
    }

    async fn create_port(&self, request: &PortCreate) -> Result<Port, ServiceError> {
        let mut inner = self.lock()?;
        let id = inner.next_id("port");
        inner.record(format!(
            "create_port {id} {} {}",
            request.network_id, request.mac_address
        ));
        let port = Port {
            id,
            network_id: request.network_id.clone(),
            mac_address: request.mac_address.clone(),
        };
        inner.ports.push((port.clone(), request.fixed_ip.clone()));
        Ok(port)
    }

    async fn delete_port(&self, port_id: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record(format!("delete_port {port_id}"));
        let before = inner.ports.len();
        inner.ports.retain(|(port, _)| port.id != port_id);
        if inner.ports.len() == before {
            return Err(ServiceError::not_found("port", port_id));
        }
        Ok(())
    }

    async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<Network>, ServiceError> {
        let inner = self.lock()?;
        Ok(inner
            .networks
            .iter()
            .filter(|net| match filter {
                NetworkFilter::Id(id) => &net.id == id,
                NetworkFilter::Name(name) => &net.name == name,
            })
            .cloned()
            .collect())
    }

    async fn list_subnets(&self) -> Result<Vec<Subnet>, ServiceError> {
        Ok(self.lock()?.subnets.clone())
    }
}

#[async_trait]
impl IdentityService for InMemoryCloud {
    async fn tenant_id_by_name(&self, name: &str) -> Result<String, ServiceError> {
        let inner = self.lock()?;
        inner
            .tenants
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("tenant", name))
    }
}

#[async_trait]
impl ControlPlaneDb for InMemoryCloud {
    async fn execute(&self, statement: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        inner.record("db_execute".to_string());
        inner.statements.push(statement.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryCloud;
    use crate::clients::{ComputeService, VolumeCreate, VolumeService};

    #[tokio::test]
    async fn volume_reaches_available_after_lagging_polls() {
        let cloud = InMemoryCloud::new();
        cloud.set_status_lag(2);

        let volume = cloud
            .create_volume(&VolumeCreate {
                size: 10,
                ..VolumeCreate::default()
            })
            .await
            .expect("create");

        let first = cloud.get_volume(&volume.id).await.expect("get");
        let second = cloud.get_volume(&volume.id).await.expect("get");
        let third = cloud.get_volume(&volume.id).await.expect("get");

        assert_eq!(first.status, "creating");
        assert_eq!(second.status, "creating");
        assert_eq!(third.status, "available");
    }

    #[tokio::test]
    async fn unknown_flavor_is_not_found() {
        let cloud = InMemoryCloud::new();
        cloud.add_flavor("f-1", "m1.small");

        assert!(cloud.find_flavor("m1.small").await.is_ok());
        let err = cloud.find_flavor("m1.huge").await.expect_err("missing");
        assert!(err.is_not_found());
    }
}
