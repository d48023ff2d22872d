use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: 0,
            output: output.into(),
        }
    }

    pub fn failed(status: i32, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to start session to {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session to {host} ended abnormally: {reason}")]
    Session { host: String, reason: String },
}

/// Runs shell command strings on named hosts.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct SshSettings {
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub forward_agent: bool,
    pub connect_timeout: Option<Duration>,
}

/// Transport backed by the local `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn destination(&self, host: &str) -> String {
        match &self.settings.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-oStrictHostKeyChecking=no").arg("-oBatchMode=yes");
        if self.settings.forward_agent {
            cmd.arg("-A");
        }
        if let Some(identity) = &self.settings.identity_file {
            cmd.arg("-i").arg(identity);
        }
        if let Some(timeout) = self.settings.connect_timeout {
            cmd.arg(format!("-oConnectTimeout={}", timeout.as_secs().max(1)));
        }
        cmd.arg(self.destination(host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, TransportError> {
        let output = self
            .command(host, command)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                host: host.to_string(),
                source,
            })?;

        let status = output.status.code().ok_or_else(|| TransportError::Session {
            host: host.to_string(),
            reason: "terminated by signal".to_string(),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(host = %host, status, "remote command finished");
        Ok(CommandOutput {
            status,
            output: combined,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCommand {
    pub host: String,
    pub command: String,
}

#[derive(Debug, Clone)]
struct Reply {
    needle: String,
    output: CommandOutput,
}

/// Records every command and answers from canned replies; nothing leaves the
/// process. Used for dry runs and for exercising pipelines in tests.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    issued: Mutex<Vec<IssuedCommand>>,
    replies: Mutex<Vec<Reply>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `needle` get `output`; the first registered match wins.
    pub fn reply_to(&self, needle: impl Into<String>, output: CommandOutput) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(Reply {
                needle: needle.into(),
                output,
            });
        }
    }

    pub fn issued(&self) -> Vec<IssuedCommand> {
        self.issued
            .lock()
            .map(|issued| issued.clone())
            .unwrap_or_default()
    }

    pub fn commands_containing(&self, needle: &str) -> Vec<IssuedCommand> {
        self.issued()
            .into_iter()
            .filter(|issued| issued.command.contains(needle))
            .collect()
    }
}

#[async_trait]
impl RemoteTransport for DryRunTransport {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, TransportError> {
        info!(host = %host, "dry-run command recorded");
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(IssuedCommand {
                host: host.to_string(),
                command: command.to_string(),
            });
        }

        let replies = self.replies.lock().map_err(|_| TransportError::Session {
            host: host.to_string(),
            reason: "reply table poisoned".to_string(),
        })?;
        Ok(replies
            .iter()
            .find(|reply| command.contains(&reply.needle))
            .map(|reply| reply.output.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }
}
