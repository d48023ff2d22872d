pub mod codec;
pub mod instance;
pub mod plan;
pub mod request;
pub mod state;
pub mod volume;

pub use codec::{decode_canonical, decode_snapshot, encode_canonical, encode_snapshot, CodecError};
pub use instance::{
    BlockDeviceMapping, FlavorHandle, ImageHandle, InstanceBuildParameters, NicBinding,
    ServerHandle, STATUS_ACTIVE, STATUS_SHUTOFF,
};
pub use plan::{Backend, TransferMode, TransferPlan};
pub use request::{
    DiskLocation, DiskType, FloatingBinding, ImageId, ImageRef, InstanceId, KeyPair,
    MigrationRequest, NetworkAttachment, SourceVolume, VolumeId,
};
pub use state::{StateViolation, WorkflowState};
pub use volume::{VolumeHandle, VolumeRecord, SOURCE_ID_KEY, STATUS_AVAILABLE, STATUS_IN_USE};
