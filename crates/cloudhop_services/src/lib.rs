pub mod clients;
pub mod database;
pub mod memory;
pub mod transport;

pub use clients::{
    ByteStream, CloudServices, ComputeService, DestinationCloud, IdentityService, ImageCreate,
    ImageService, Network, NetworkFilter, NetworkService, Port, PortCreate, SecurityGroup,
    ServiceError, SourceCloud, Subnet, UploadToImage, VolumeCreate, VolumeService, VolumeUpdate,
};
pub use database::{bootable_patch, ControlPlaneDb, MysqlPatcher};
pub use memory::{content_checksum, InMemoryCloud};
pub use transport::{
    CommandOutput, DryRunTransport, IssuedCommand, RemoteTransport, SshSettings, SshTransport,
    TransportError,
};
