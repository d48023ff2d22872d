use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::request::{SourceVolume, VolumeId};

/// Metadata key tying a destination volume back to its source volume.
pub const SOURCE_ID_KEY: &str = "source_id";

pub const STATUS_AVAILABLE: &str = "available";
pub const STATUS_IN_USE: &str = "in-use";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeHandle {
    pub id: VolumeId,
    pub size: u64,
    #[serde(default)]
    pub display_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VolumeHandle {
    pub fn source_id(&self) -> Option<&str> {
        self.metadata.get(SOURCE_ID_KEY).map(String::as_str)
    }
}

/// A source volume and, once provisioned, its destination counterpart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    pub source: SourceVolume,
    pub destination: Option<VolumeHandle>,
}

impl VolumeRecord {
    pub fn pending(source: SourceVolume) -> Self {
        Self {
            source,
            destination: None,
        }
    }

    pub fn provisioned(source: SourceVolume, destination: VolumeHandle) -> Self {
        Self {
            source,
            destination: Some(destination),
        }
    }

    /// True when the destination volume is tagged with this record's source id.
    pub fn is_correlated(&self) -> bool {
        match &self.destination {
            Some(dest) => dest.source_id() == Some(self.source.id.as_str()),
            None => true,
        }
    }
}
