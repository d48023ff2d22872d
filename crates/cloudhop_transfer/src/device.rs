use std::collections::BTreeSet;
use std::sync::Arc;

use cloudhop_contract::ServerHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransferError;
use crate::pipeline::{PipelineExecutor, RemoteCommand};

/// Which of an instance's hypervisor disks to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSlot {
    Root,
    Ephemeral,
    Volume(String),
}

impl DiskSlot {
    fn pattern(&self, instance_id: &str) -> String {
        match self {
            Self::Root => format!("{instance_id}/disk"),
            Self::Ephemeral => format!("{instance_id}/disk.local"),
            Self::Volume(volume_id) => format!("volume-{volume_id}"),
        }
    }

    fn matches(&self, pattern: &str, device: &str) -> bool {
        match self {
            Self::Root | Self::Ephemeral => device.ends_with(pattern),
            Self::Volume(_) => device.match_indices(pattern).any(|(at, _)| {
                let before = device[..at].chars().next_back();
                let rest = &device[at + pattern.len()..];
                matches!(before, None | Some(':' | '/')) && (rest.is_empty() || rest.starts_with("-lun-"))
            }),
        }
    }
}

/// Picks the single device in a `virsh domblklist` listing that belongs to
/// `slot`. Zero or several candidates are both errors.
pub fn match_device(
    listing: &str,
    instance_id: &str,
    slot: &DiskSlot,
) -> Result<String, TransferError> {
    let pattern = slot.pattern(instance_id);
    let candidates: BTreeSet<&str> = listing
        .split_whitespace()
        .filter(|token| slot.matches(&pattern, token))
        .collect();

    let mut found = candidates.into_iter();
    match (found.next(), found.next()) {
        (Some(device), None) => Ok(device.to_string()),
        (first, second) => Err(TransferError::DevicePathNotFound {
            instance_id: instance_id.to_string(),
            pattern,
            matches: first
                .into_iter()
                .chain(second)
                .chain(found)
                .map(str::to_string)
                .collect(),
        }),
    }
}

/// Discovers destination device paths by asking the hypervisor through the
/// destination gateway.
pub struct DeviceLocator {
    executor: Arc<PipelineExecutor>,
    gateway: String,
}

impl DeviceLocator {
    pub fn new(executor: Arc<PipelineExecutor>, gateway: impl Into<String>) -> Self {
        Self {
            executor,
            gateway: gateway.into(),
        }
    }

    pub async fn locate(
        &self,
        server: &ServerHandle,
        slot: &DiskSlot,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let (Some(host), Some(instance_name)) = (&server.host, &server.instance_name) else {
            return Err(TransferError::UnplacedInstance {
                instance_id: server.id.clone(),
            });
        };
        let listing = self
            .executor
            .run_command(
                &RemoteCommand::via(
                    self.gateway.clone(),
                    host,
                    &format!("virsh domblklist {instance_name}"),
                ),
                cancel,
            )
            .await?;
        let device = match_device(&listing.output, &server.id, slot)?;
        debug!(instance_id = %server.id, device = %device, "destination device detected");
        Ok(device)
    }
}
