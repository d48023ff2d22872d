use cloudhop_contract::{Backend, TransferMode, TransferPlan};

use crate::commands;
use crate::error::TransferError;
use crate::pipeline::{Compression, Pipeline, RemoteCommand, Sink, Source, Tunnel};

/// Byte-streaming recipes that move one volume between backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRecipe {
    DirectCopy,
    ImportToStore,
    ExportFromStore,
    StoreToStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipe {
    Pipeline(PipelineRecipe),
    /// Volume content goes through the image catalogs instead of a pipeline.
    ViaImageService,
}

static ROUTES: [(Backend, Backend, PipelineRecipe); 4] = [
    (Backend::Iscsi, Backend::Iscsi, PipelineRecipe::DirectCopy),
    (Backend::Iscsi, Backend::DistributedStore, PipelineRecipe::ImportToStore),
    (Backend::DistributedStore, Backend::Iscsi, PipelineRecipe::ExportFromStore),
    (
        Backend::DistributedStore,
        Backend::DistributedStore,
        PipelineRecipe::StoreToStore,
    ),
];

/// Picks the data path for a transfer plan. The image-service mode does not
/// depend on the backend pair.
pub fn resolve(plan: &TransferPlan) -> Result<Recipe, TransferError> {
    if plan.mode == TransferMode::ViaImageService {
        return Ok(Recipe::ViaImageService);
    }
    ROUTES
        .iter()
        .find(|(source, dest, _)| *source == plan.source_backend && *dest == plan.dest_backend)
        .map(|(_, _, recipe)| Recipe::Pipeline(*recipe))
        .ok_or_else(|| TransferError::BackendResolution {
            source_backend: plan.source_backend.clone(),
            dest_backend: plan.dest_backend.clone(),
        })
}

/// Fixed addressing shared by every transfer of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLayout {
    pub source_gateway: String,
    pub dest_gateway: String,
    pub tunnel_port: u16,
    pub source_pool: String,
    pub dest_pool: String,
    pub compute_pool: String,
    pub compression: Compression,
}

impl TransferLayout {
    fn tunnel_to(&self, compute_host: &str) -> Tunnel {
        Tunnel {
            via: self.dest_gateway.clone(),
            target: compute_host.to_string(),
            local_port: self.tunnel_port,
        }
    }

    fn remove_store_image(&self, pool: &str, image: &str) -> RemoteCommand {
        RemoteCommand::on(self.dest_gateway.clone(), commands::remove_store_image(pool, image))
            .tolerant()
    }

    /// Copies a file from a source compute host onto a destination compute
    /// host through a tunnel opened from the source gateway.
    pub fn file_copy(
        &self,
        source_host: &str,
        source_path: &str,
        dest_host: &str,
        dest_path: &str,
        compression: Compression,
    ) -> Pipeline {
        Pipeline::new(
            self.source_gateway.clone(),
            Source::BlockDevice {
                host: source_host.to_string(),
                path: source_path.to_string(),
            },
            Sink::BlockDevice {
                host: dest_host.to_string(),
                path: dest_path.to_string(),
            },
        )
        .compressed(compression)
        .through(self.tunnel_to(dest_host))
    }

    /// Copies a file from a source compute host into a directory on the
    /// destination gateway.
    pub fn stage_on_gateway(&self, source_host: &str, source_path: &str, dest_path: &str) -> Pipeline {
        Pipeline::new(
            self.source_gateway.clone(),
            Source::BlockDevice {
                host: source_host.to_string(),
                path: source_path.to_string(),
            },
            Sink::BlockDevice {
                host: self.dest_gateway.clone(),
                path: dest_path.to_string(),
            },
        )
    }

    /// Streams an ephemeral disk into the compute pool as `<instance>_disk.local`.
    ///
    /// File-backed ephemerals are flattened to raw on their compute host;
    /// store-backed ones were already exported onto the source gateway.
    pub fn ephemeral_to_store(
        &self,
        source_host: &str,
        source_path: &str,
        instance_id: &str,
        source_is_store: bool,
        compression: Compression,
    ) -> Pipeline {
        let image = format!("{instance_id}_disk.local");
        let source = if source_is_store {
            Source::LocalFile {
                path: source_path.to_string(),
            }
        } else {
            let workdir = source_path
                .rsplit_once('/')
                .map(|(dir, _)| dir)
                .filter(|dir| !dir.is_empty())
                .unwrap_or("/");
            Source::RawConverted {
                host: source_host.to_string(),
                workdir: workdir.to_string(),
                path: source_path.to_string(),
            }
        };
        let mut pipeline = Pipeline::new(
            self.source_gateway.clone(),
            source,
            Sink::StoreImport {
                host: self.dest_gateway.clone(),
                pool: self.compute_pool.clone(),
                image: image.clone(),
            },
        )
        .compressed(compression)
        .after_removing(self.remove_store_image(&self.compute_pool, &image));
        if source_is_store {
            pipeline = pipeline.then(RemoteCommand::on(
                self.source_gateway.clone(),
                format!("rm -f {source_path}"),
            ));
        }
        pipeline
    }
}

/// Per-volume endpoints known once both sides exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEndpoints {
    pub source_volume_id: String,
    /// Source compute host the volume is attached on.
    pub source_host: String,
    pub source_path: Option<String>,
    pub dest_volume_id: String,
    pub dest_compute_host: String,
    /// Device path detected on the destination hypervisor.
    pub dest_device: Option<String>,
}

fn store_image(volume_id: &str) -> String {
    format!("volume-{volume_id}")
}

impl PipelineRecipe {
    /// Whether the destination end is a hypervisor block device that must be
    /// detected before building the pipeline.
    pub fn needs_dest_device(self) -> bool {
        matches!(self, Self::DirectCopy | Self::ExportFromStore)
    }

    pub fn build(
        self,
        layout: &TransferLayout,
        endpoints: &VolumeEndpoints,
    ) -> Result<Pipeline, TransferError> {
        let source_path = || {
            endpoints
                .source_path
                .clone()
                .ok_or_else(|| TransferError::MissingEndpoint {
                    volume_id: endpoints.source_volume_id.clone(),
                    what: "source device path",
                })
        };
        let dest_device = || {
            endpoints
                .dest_device
                .clone()
                .ok_or_else(|| TransferError::MissingEndpoint {
                    volume_id: endpoints.dest_volume_id.clone(),
                    what: "destination device path",
                })
        };
        let dest_image = store_image(&endpoints.dest_volume_id);

        let pipeline = match self {
            Self::DirectCopy => layout.file_copy(
                &endpoints.source_host,
                &source_path()?,
                &endpoints.dest_compute_host,
                &dest_device()?,
                layout.compression,
            ),
            Self::ImportToStore => Pipeline::new(
                layout.source_gateway.clone(),
                Source::BlockDevice {
                    host: endpoints.source_host.clone(),
                    path: source_path()?,
                },
                Sink::StoreImport {
                    host: layout.dest_gateway.clone(),
                    pool: layout.dest_pool.clone(),
                    image: dest_image.clone(),
                },
            )
            .after_removing(layout.remove_store_image(&layout.dest_pool, &dest_image)),
            Self::ExportFromStore => Pipeline::new(
                layout.source_gateway.clone(),
                Source::StoreExport {
                    pool: layout.source_pool.clone(),
                    image: store_image(&endpoints.source_volume_id),
                },
                Sink::BlockDevice {
                    host: endpoints.dest_compute_host.clone(),
                    path: dest_device()?,
                },
            )
            .through(layout.tunnel_to(&endpoints.dest_compute_host)),
            Self::StoreToStore => Pipeline::new(
                layout.source_gateway.clone(),
                Source::StoreExport {
                    pool: layout.source_pool.clone(),
                    image: store_image(&endpoints.source_volume_id),
                },
                Sink::StoreImport {
                    host: layout.dest_gateway.clone(),
                    pool: layout.dest_pool.clone(),
                    image: dest_image.clone(),
                },
            )
            .after_removing(layout.remove_store_image(&layout.dest_pool, &dest_image)),
        };
        Ok(pipeline)
    }
}
