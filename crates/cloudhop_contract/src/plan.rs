use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage technology behind a volume.
///
/// Unknown names are kept as [`Backend::Other`] so that a misconfigured
/// backend surfaces as a resolution error instead of a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Backend {
    Iscsi,
    DistributedStore,
    Other(String),
}

impl FromStr for Backend {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "iscsi" => Self::Iscsi,
            "distributed_store" | "ceph" | "rbd" => Self::DistributedStore,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<String> for Backend {
    fn from(raw: String) -> Self {
        match raw.parse() {
            Ok(backend) => backend,
            Err(never) => match never {},
        }
    }
}

impl From<Backend> for String {
    fn from(backend: Backend) -> Self {
        backend.to_string()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iscsi => f.write_str("iscsi"),
            Self::DistributedStore => f.write_str("distributed_store"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Direct,
    ViaImageService,
}

/// Derived per migration from configuration; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub source_backend: Backend,
    pub dest_backend: Backend,
    pub mode: TransferMode,
}
