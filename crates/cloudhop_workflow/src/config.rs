use std::collections::BTreeMap;
use std::time::Duration;

use cloudhop_contract::{Backend, TransferMode, TransferPlan};
use cloudhop_transfer::{resolve, Compression, ExecutorSettings, ImageCli, Recipe, TransferLayout};
use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::Deserialize;
use serde_json::Value;

use crate::error::WorkflowError;

/// Everything a migration needs to know about both clouds. Built once and
/// shared read-only between every component of a run.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    pub source: SourceSection,
    pub destination: DestinationSection,
    #[serde(default)]
    pub transfer_file: CompressionSection,
    #[serde(default)]
    pub transfer_ephemeral: CompressionSection,
    #[serde(default)]
    pub ephemeral_drives: EphemeralSection,
    #[serde(default)]
    pub volumes: VolumesSection,
    #[serde(default)]
    pub wait: WaitPolicy,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub import_rules: ImportRules,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    pub gateway: String,
    #[serde(default = "default_ssh_transfer_port")]
    pub ssh_transfer_port: u16,
    #[serde(default = "default_backend")]
    pub volume_backend: Backend,
    #[serde(default)]
    pub transfer_volumes_via_image_service: bool,
    #[serde(default = "default_volume_pool")]
    pub volume_pool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSection {
    pub gateway: String,
    /// Administrative tenant owning the shared subnets.
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_backend")]
    pub volume_backend: Backend,
    #[serde(default = "default_volume_pool")]
    pub volume_pool: String,
    #[serde(default = "default_compute_pool")]
    pub compute_pool: String,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default)]
    pub keep_ip: bool,
    /// Bytes per second for image streaming; `None` is unthrottled.
    #[serde(default, deserialize_with = "speed_limit")]
    pub speed_limit: Option<u64>,
    /// Fold a root-disk overlay into a new base image before the instance is created.
    #[serde(default)]
    pub merge_delta_before_create: bool,
    #[serde(default)]
    pub image_cli: Option<ImageCli>,
    #[serde(default)]
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[default]
    Dd,
    Gzip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionSection {
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default = "default_level")]
    pub level: u32,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Dd,
            level: default_level(),
        }
    }
}

impl CompressionSection {
    pub fn compression(&self) -> Compression {
        match self.compression {
            CompressionKind::Dd => Compression::None,
            CompressionKind::Gzip => Compression::Gzip { level: self.level },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EphemeralSection {
    /// Ephemeral disks of destination instances live in the distributed store.
    #[serde(default, alias = "ceph")]
    pub store: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumesSection {
    #[serde(default)]
    pub attach_before_transfer: Option<bool>,
}

/// Polling behaviour for status waits. Zero limits mean unbounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub max_duration_secs: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub failure_statuses: Vec<String>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 0,
            max_duration_secs: 0,
            multiplier: 1.0,
            max_interval_ms: 30_000,
            failure_statuses: vec!["error".to_string(), "ERROR".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub stage_timeout_secs: u64,
    pub forward_agent: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            stage_timeout_secs: 0,
            forward_agent: true,
        }
    }
}

/// Which destination network an overridden attachment lands on. The port's
/// MAC and address always come from the request.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct NetworkSelector {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Operator overrides applied while deriving instance parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportRules {
    #[serde(default)]
    pub overwrite: BTreeMap<String, Value>,
    #[serde(default)]
    pub default: BTreeMap<String, Value>,
}

impl ImportRules {
    /// An overwrite rule wins, then the request's own value, then a default rule.
    pub fn resolve<T: DeserializeOwned>(
        &self,
        field: &str,
        requested: Option<T>,
    ) -> Result<Option<T>, WorkflowError> {
        if let Some(value) = self.overwrite.get(field) {
            return Self::decode(field, value).map(Some);
        }
        if requested.is_some() {
            return Ok(requested);
        }
        self.default
            .get(field)
            .map(|value| Self::decode(field, value))
            .transpose()
    }

    /// Replacement for the request's network at `index`, if one is configured.
    pub fn network_override(
        &self,
        index: usize,
    ) -> Result<Option<NetworkSelector>, WorkflowError> {
        match self.overwrite.get("networks").and_then(|nets| nets.get(index)) {
            Some(value) => Self::decode("networks", value).map(Some),
            None => Ok(None),
        }
    }

    fn decode<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, WorkflowError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            WorkflowError::InvalidState(format!("import rule for {field} is malformed: {err}"))
        })
    }
}

impl MigrationConfig {
    pub fn transfer_plan(&self) -> TransferPlan {
        TransferPlan {
            source_backend: self.source.volume_backend.clone(),
            dest_backend: self.destination.volume_backend.clone(),
            mode: if self.source.transfer_volumes_via_image_service {
                TransferMode::ViaImageService
            } else {
                TransferMode::Direct
            },
        }
    }

    /// Block-device destinations need the volume attached before its device
    /// path can be detected.
    pub fn attach_before_transfer(&self) -> bool {
        self.volumes
            .attach_before_transfer
            .unwrap_or(self.destination.volume_backend == Backend::Iscsi)
    }

    /// Rejects settings that could only fail once volumes are being copied.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if let Ok(Recipe::Pipeline(recipe)) = resolve(&self.transfer_plan()) {
            if recipe.needs_dest_device() && !self.attach_before_transfer() {
                return Err(WorkflowError::InvalidConfig(format!(
                    "{recipe:?} into {:?} volumes writes to the attached device; volumes.attach_before_transfer cannot be false",
                    self.destination.volume_backend
                )));
            }
        }
        Ok(())
    }

    pub fn transfer_layout(&self) -> TransferLayout {
        TransferLayout {
            source_gateway: self.source.gateway.clone(),
            dest_gateway: self.destination.gateway.clone(),
            tunnel_port: self.source.ssh_transfer_port,
            source_pool: self.source.volume_pool.clone(),
            dest_pool: self.destination.volume_pool.clone(),
            compute_pool: self.destination.compute_pool.clone(),
            compression: self.transfer_file.compression(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        let mut secrets = Vec::new();
        if let Some(cli) = &self.destination.image_cli {
            secrets.push(cli.password.clone());
        }
        if let Some(password) = &self.destination.database.password {
            secrets.push(password.clone());
        }
        ExecutorSettings {
            stage_timeout: (self.pipeline.stage_timeout_secs > 0)
                .then(|| Duration::from_secs(self.pipeline.stage_timeout_secs)),
            secrets,
        }
    }
}

fn default_ssh_transfer_port() -> u16 {
    9999
}

fn default_backend() -> Backend {
    Backend::Iscsi
}

fn default_volume_pool() -> String {
    "volumes".to_string()
}

fn default_compute_pool() -> String {
    "compute".to_string()
}

fn default_tenant() -> String {
    "admin".to_string()
}

fn default_temp_dir() -> String {
    "/tmp/cloudhop".to_string()
}

fn default_level() -> u32 {
    7
}

fn speed_limit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(0) => Ok(None),
        Raw::Bytes(bytes) => Ok(Some(bytes)),
        Raw::Text(text) => parse_rate(&text).map_err(D::Error::custom),
    }
}

fn parse_rate(text: &str) -> Result<Option<u64>, String> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("off") || text.is_empty() {
        return Ok(None);
    }
    let (digits, scale) = match text.char_indices().last() {
        Some((at, 'K' | 'k')) => (&text[..at], 1024),
        Some((at, 'M' | 'm')) => (&text[..at], 1024 * 1024),
        Some((at, 'G' | 'g')) => (&text[..at], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|value| (value > 0).then_some(value * scale))
        .map_err(|_| format!("invalid speed limit {text:?}"))
}
