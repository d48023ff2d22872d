use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::request::{ImageId, InstanceId};

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_SHUTOFF: &str = "SHUTOFF";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageHandle {
    pub id: ImageId,
    pub name: String,
    pub checksum: Option<String>,
    pub status: String,
    pub disk_format: String,
    pub container_format: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlavorHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicBinding {
    pub net_id: String,
    pub port_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDeviceMapping {
    pub source_type: String,
    pub uuid: ImageId,
    pub destination_type: String,
    pub volume_size: u64,
    pub delete_on_termination: bool,
    pub boot_index: u32,
}

impl BlockDeviceMapping {
    /// Root volume built from `image_id` and destroyed with the instance.
    pub fn boot_volume_from_image(image_id: &str, volume_size: u64) -> Self {
        Self {
            source_type: "image".to_string(),
            uuid: image_id.to_string(),
            destination_type: "volume".to_string(),
            volume_size,
            delete_on_termination: true,
            boot_index: 0,
        }
    }
}

/// Destination-shaped instance creation payload, filled in step by step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceBuildParameters {
    pub name: Option<String>,
    pub tenant_name: Option<String>,
    pub image: Option<ImageHandle>,
    pub flavor: Option<FlavorHandle>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub key_name: Option<String>,
    pub config_drive: Option<bool>,
    pub disk_config: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub nics: Vec<NicBinding>,
    #[serde(default)]
    pub block_device_mapping: Vec<BlockDeviceMapping>,
}

/// A server created on the destination cloud.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerHandle {
    pub id: InstanceId,
    pub name: String,
    pub status: String,
    /// Hypervisor host the scheduler placed the server on.
    #[serde(default)]
    pub host: Option<String>,
    /// Hypervisor domain name of the server.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Network name to fixed addresses.
    #[serde(default)]
    pub networks: BTreeMap<String, Vec<String>>,
}
