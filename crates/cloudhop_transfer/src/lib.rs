pub mod commands;
pub mod device;
pub mod error;
pub mod locks;
pub mod pipeline;
pub mod strategy;

pub use commands::{parse_backing_file, ImageCli};
pub use device::{match_device, DeviceLocator, DiskSlot};
pub use error::TransferError;
pub use locks::KeyedLocks;
pub use pipeline::{
    Compression, ExecutorSettings, Pipeline, PipelineExecutor, RemoteCommand, Sink, Source, Tunnel,
};
pub use strategy::{resolve, PipelineRecipe, Recipe, TransferLayout, VolumeEndpoints};
