use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::clients::ServiceError;
use crate::transport::RemoteTransport;

/// Administrative write access to the destination control-plane database.
#[async_trait]
pub trait ControlPlaneDb: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<(), ServiceError>;
}

/// Runs statements with the `mysql` client on the destination controller.
pub struct MysqlPatcher {
    transport: Arc<dyn RemoteTransport>,
    host: String,
    user: Option<String>,
    password: Option<String>,
}

impl MysqlPatcher {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        host: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            user,
            password,
        }
    }

    fn render(&self, statement: &str) -> String {
        let mut cmd = String::from("mysql");
        if let Some(user) = self.user.as_deref().filter(|user| !user.is_empty()) {
            cmd.push_str(&format!(" -u {user}"));
        }
        if let Some(password) = self.password.as_deref().filter(|pw| !pw.is_empty()) {
            cmd.push_str(&format!(" -p{password}"));
        }
        cmd.push_str(&format!(" -e '{statement}'"));
        cmd
    }
}

#[async_trait]
impl ControlPlaneDb for MysqlPatcher {
    async fn execute(&self, statement: &str) -> Result<(), ServiceError> {
        info!(host = %self.host, "patching control-plane database");
        let output = self
            .transport
            .execute(&self.host, &self.render(statement))
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(ServiceError::Api(format!(
                "mysql exited with {}: {}",
                output.status,
                output.output.trim()
            )))
        }
    }
}

/// Statement correcting a volume's bootable flag, which the volume API cannot set.
pub fn bootable_patch(volume_id: &str, bootable: bool) -> String {
    format!(
        "use cinder;update volumes set volumes.bootable={} where volumes.id=\"{}\"",
        u8::from(bootable),
        volume_id
    )
}
