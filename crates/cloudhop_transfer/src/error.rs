use std::time::Duration;

use cloudhop_contract::Backend;
use cloudhop_services::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no transfer recipe for {source_backend} -> {dest_backend}")]
    BackendResolution {
        source_backend: Backend,
        dest_backend: Backend,
    },
    #[error("no unique device matching {pattern} for instance {instance_id} (matches: {matches:?})")]
    DevicePathNotFound {
        instance_id: String,
        pattern: String,
        matches: Vec<String>,
    },
    #[error("instance {instance_id} has no hypervisor placement yet")]
    UnplacedInstance { instance_id: String },
    #[error("volume {volume_id} is missing its {what}")]
    MissingEndpoint {
        volume_id: String,
        what: &'static str,
    },
    #[error("command on {host} exited with {status}: {command}: {output}")]
    RemoteCommandFailure {
        host: String,
        command: String,
        status: i32,
        output: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("stage {stage} did not finish within {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },
    #[error(transparent)]
    Transport(#[from] TransportError),
}
