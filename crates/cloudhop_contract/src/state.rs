use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::{InstanceBuildParameters, ServerHandle};
use crate::request::MigrationRequest;
use crate::volume::VolumeRecord;

/// Everything a migration needs to pick up where it stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowState {
    pub pending_request: Option<MigrationRequest>,
    pub derived_parameters: InstanceBuildParameters,
    pub created_instance_handle: Option<ServerHandle>,
    #[serde(default)]
    pub created_volume_records: Vec<VolumeRecord>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateViolation {
    #[error("destination volume {volume_id} is not tagged with source volume {source_id}")]
    UncorrelatedVolume {
        source_id: String,
        volume_id: String,
    },
    #[error("source volume {0} is recorded more than once")]
    DuplicateSource(String),
}

impl WorkflowState {
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            pending_request: Some(request),
            ..Self::default()
        }
    }

    pub fn volume_record(&self, source_id: &str) -> Option<&VolumeRecord> {
        self.created_volume_records
            .iter()
            .find(|record| record.source.id == source_id)
    }

    pub fn volume_record_mut(&mut self, source_id: &str) -> Option<&mut VolumeRecord> {
        self.created_volume_records
            .iter_mut()
            .find(|record| record.source.id == source_id)
    }

    /// Every destination volume must point back at exactly one source volume.
    pub fn validate(&self) -> Result<(), StateViolation> {
        let mut seen = std::collections::BTreeSet::new();
        for record in &self.created_volume_records {
            if !seen.insert(record.source.id.as_str()) {
                return Err(StateViolation::DuplicateSource(record.source.id.clone()));
            }
            if !record.is_correlated() {
                let volume_id = record
                    .destination
                    .as_ref()
                    .map(|dest| dest.id.clone())
                    .unwrap_or_default();
                return Err(StateViolation::UncorrelatedVolume {
                    source_id: record.source.id.clone(),
                    volume_id,
                });
            }
        }
        Ok(())
    }
}
