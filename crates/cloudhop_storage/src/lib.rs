pub mod repository;

pub use repository::{
    CheckpointRecord, MigrationStorage, RunRecord, RunStatus, StorageConfig,
};
