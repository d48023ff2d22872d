pub mod checkpoint;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod image;
pub mod proxy;
pub mod runtime;
pub mod state;
pub mod step;
pub mod steps;
pub mod wait;

pub use checkpoint::{Checkpoint, CheckpointSink, MemoryCheckpoints, NoCheckpoints, StorageCheckpoints};
pub use config::{ImportRules, MigrationConfig, NetworkSelector, WaitPolicy};
pub use context::{MigrationContext, MigrationDeps};
pub use engine::{standard_chain, Migration};
pub use error::WorkflowError;
pub use image::ImageReconciler;
pub use proxy::CopyProxy;
pub use runtime::{MigrationRuntime, RunEvent};
pub use step::{Step, StepChain};
pub use wait::{StatusWaiter, WaitError};
