use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type InstanceId = String;
pub type VolumeId = String;
pub type ImageId = String;

/// Where the instance's root and ephemeral disks live on the source side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    RemoteFile,
    #[serde(alias = "ceph")]
    DistributedStore,
}

/// A reference to an image in the source image catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub id: ImageId,
    pub checksum: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskLocation {
    /// Source compute host that owns the disk files.
    pub host: String,
    /// Root disk path on `host`.
    pub path: String,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    /// Copy-on-write overlay of the root disk, when the root disk is image-backed.
    #[serde(default)]
    pub diff_path: Option<String>,
    /// Source-side image uploaded from the overlay (distributed-store disks).
    #[serde(default)]
    pub diff_image: Option<ImageRef>,
    #[serde(default)]
    pub ephemeral: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FloatingBinding {
    /// Name of the instance network the address belongs to.
    pub name: String,
    pub ip: String,
}

/// A volume attached to the source instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceVolume {
    pub id: VolumeId,
    pub size: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display_description: Option<String>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Mountpoint on the source instance, reused when attaching on the destination.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub bootable: bool,
    /// Backend-specific path: the block device on `DiskLocation::host` for
    /// iscsi-like backends.
    #[serde(default)]
    pub path: Option<String>,
    /// Pre-uploaded source image of the volume contents, if the exporter made one.
    #[serde(default)]
    pub image: Option<ImageRef>,
}

/// Immutable description of one instance to migrate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRequest {
    pub name: String,
    pub tenant_name: String,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub image: Option<ImageRef>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub key: Option<KeyPair>,
    #[serde(default)]
    pub config_drive: Option<bool>,
    #[serde(default)]
    pub disk_config: Option<String>,
    #[serde(default)]
    pub security_groups: Option<Vec<String>>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub volumes: Vec<SourceVolume>,
    #[serde(default)]
    pub floatings: Vec<FloatingBinding>,
    pub disk: DiskLocation,
    /// Size in GiB of the root volume when booting from volume.
    #[serde(default)]
    pub boot_volume_size: Option<u64>,
}

impl MigrationRequest {
    pub fn boots_from_volume(&self) -> bool {
        self.boot_volume_size.is_some()
    }
}
