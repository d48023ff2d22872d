use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cloudhop_services::{CommandOutput, RemoteTransport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::locks::KeyedLocks;

const SSH: &str = "ssh -oStrictHostKeyChecking=no";
const BLOCK: &str = "bs=1M";
const EPHEMERAL_SCRATCH: &str = "disk.local.temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip {
        level: u32,
    },
}

/// Producing end of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A file or block device on a remote host.
    BlockDevice { host: String, path: String },
    /// A remote disk converted to raw in `workdir` before it is read.
    RawConverted {
        host: String,
        workdir: String,
        path: String,
    },
    /// A file on the gateway itself.
    LocalFile { path: String },
    StoreExport { pool: String, image: String },
}

/// Consuming end of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    BlockDevice { host: String, path: String },
    StoreImport {
        host: String,
        pool: String,
        image: String,
    },
}

/// Local port forward from the gateway to `target`'s ssh port through `via`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub via: String,
    pub target: String,
    pub local_port: u16,
}

impl Tunnel {
    fn forward_spec(&self) -> String {
        format!("{}:{}:22", self.local_port, self.target)
    }

    pub fn open_command(&self) -> String {
        format!("{SSH} -f -N -L {} {}", self.forward_spec(), self.via)
    }

    pub fn close_command(&self) -> String {
        format!("pkill -f '{}'", self.forward_spec())
    }
}

/// A single shell command issued through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub host: String,
    pub command: String,
    /// A non-zero exit is logged and otherwise ignored.
    pub tolerate_failure: bool,
}

impl RemoteCommand {
    pub fn on(host: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command: command.into(),
            tolerate_failure: false,
        }
    }

    /// Runs `command` on `target` by hopping through `gateway`.
    pub fn via(gateway: impl Into<String>, target: &str, command: &str) -> Self {
        Self::on(gateway, format!("{SSH} {target} '{command}'"))
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }
}

/// A producer/consumer byte stream run from `gateway`, with the commands
/// that must precede and follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub gateway: String,
    pub source: Source,
    pub sink: Sink,
    pub compression: Compression,
    pub tunnel: Option<Tunnel>,
    /// Removal of stale destination artifacts.
    pub preclean: Vec<RemoteCommand>,
    pub cleanup: Vec<RemoteCommand>,
}

impl Pipeline {
    pub fn new(gateway: impl Into<String>, source: Source, sink: Sink) -> Self {
        Self {
            gateway: gateway.into(),
            source,
            sink,
            compression: Compression::None,
            tunnel: None,
            preclean: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub fn compressed(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn through(mut self, tunnel: Tunnel) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn after_removing(mut self, command: RemoteCommand) -> Self {
        self.preclean.push(command);
        self
    }

    pub fn then(mut self, command: RemoteCommand) -> Self {
        self.cleanup.push(command);
        self
    }

    /// Lock keys for everything this pipeline occupies: the endpoint hosts
    /// and, when tunneled, the forwarded port on the gateway.
    pub fn lock_keys(&self) -> BTreeSet<String> {
        let mut hosts = BTreeSet::new();
        if let Some(tunnel) = &self.tunnel {
            hosts.insert(format!("tunnel:{}:{}", self.gateway, tunnel.local_port));
        }
        match &self.source {
            Source::BlockDevice { host, .. } | Source::RawConverted { host, .. } => {
                hosts.insert(host.clone());
            }
            Source::LocalFile { .. } | Source::StoreExport { .. } => {}
        }
        match &self.sink {
            Sink::BlockDevice { host, .. } | Sink::StoreImport { host, .. } => {
                hosts.insert(host.clone());
            }
        }
        hosts
    }

    fn render_source(&self) -> String {
        let read = |path: &str| match self.compression {
            Compression::None => format!("dd {BLOCK} if={path}"),
            Compression::Gzip { level } => format!("gzip -{level} -c {path}"),
        };
        match &self.source {
            Source::BlockDevice { host, path } => format!("{SSH} {host} '{}'", read(path)),
            Source::RawConverted {
                host,
                workdir,
                path,
            } => format!(
                "{SSH} {host} 'cd {workdir} && qemu-img convert -O raw {path} {EPHEMERAL_SCRATCH} && {}'",
                read(EPHEMERAL_SCRATCH)
            ),
            Source::LocalFile { path } => read(path),
            Source::StoreExport { pool, image } => {
                let export = format!("rbd export -p {pool} {image} -");
                match self.compression {
                    Compression::None => export,
                    Compression::Gzip { level } => format!("{export} | gzip -{level} -c"),
                }
            }
        }
    }

    fn render_sink(&self) -> String {
        let unpack = match self.compression {
            Compression::None => "",
            Compression::Gzip { .. } => "gunzip | ",
        };
        match &self.sink {
            Sink::BlockDevice { host, path } => {
                let write = format!("{unpack}dd {BLOCK} of={path}");
                match &self.tunnel {
                    Some(tunnel) => format!("{SSH} -p {} localhost '{write}'", tunnel.local_port),
                    None => format!("{SSH} {host} '{write}'"),
                }
            }
            Sink::StoreImport { host, pool, image } => format!(
                "{SSH} {host} '{unpack}rbd import --image-format=2 - {pool}/{image}'"
            ),
        }
    }

    /// The shell pipeline executed on the gateway.
    pub fn render(&self) -> String {
        format!(
            "set -o pipefail; {} | {}",
            self.render_source(),
            self.render_sink()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorSettings {
    /// Upper bound for a single remote command; `None` waits indefinitely.
    pub stage_timeout: Option<Duration>,
    /// Values masked out of logged commands and error messages.
    pub secrets: Vec<String>,
}

/// Runs pipelines and single commands over a [`RemoteTransport`].
pub struct PipelineExecutor {
    transport: Arc<dyn RemoteTransport>,
    locks: KeyedLocks,
    settings: ExecutorSettings,
}

impl PipelineExecutor {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        locks: KeyedLocks,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            transport,
            locks,
            settings,
        }
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    fn mask(&self, command: &str) -> String {
        self.settings
            .secrets
            .iter()
            .filter(|secret| !secret.is_empty())
            .fold(command.to_string(), |masked, secret| {
                masked.replace(secret.as_str(), "***")
            })
    }

    async fn execute(
        &self,
        host: &str,
        command: &str,
        stage: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        debug!(host = %host, stage = %stage, command = %self.mask(command), "issuing remote command");

        let call = self.transport.execute(host, command);
        let bounded = async {
            match self.settings.stage_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .map_err(|_| TransferError::StageTimeout {
                        stage: stage.to_string(),
                        timeout: limit,
                    })?
                    .map_err(TransferError::from),
                None => call.await.map_err(TransferError::from),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = bounded => result,
        }
    }

    fn failure(&self, host: &str, command: &str, output: CommandOutput) -> TransferError {
        TransferError::RemoteCommandFailure {
            host: host.to_string(),
            command: self.mask(command),
            status: output.status,
            output: self.mask(output.output.trim()),
        }
    }

    /// Runs one command; non-zero exits fail unless the command tolerates them.
    pub async fn run_command(
        &self,
        command: &RemoteCommand,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, TransferError> {
        let output = self
            .execute(&command.host, &command.command, "command", cancel)
            .await?;
        if output.success() {
            return Ok(output);
        }
        if command.tolerate_failure {
            warn!(
                host = %command.host,
                status = output.status,
                command = %self.mask(&command.command),
                "ignoring failed remote command"
            );
            return Ok(output);
        }
        Err(self.failure(&command.host, &command.command, output))
    }

    /// Runs the whole pipeline with every touched host locked. The tunnel is
    /// torn down whether or not the stream succeeded.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let _guards = self.locks.lock_all(pipeline.lock_keys()).await;

        for command in &pipeline.preclean {
            self.run_command(command, cancel).await?;
        }

        if let Some(tunnel) = &pipeline.tunnel {
            let open = tunnel.open_command();
            let output = self.execute(&pipeline.gateway, &open, "tunnel", cancel).await?;
            if !output.success() {
                return Err(self.failure(&pipeline.gateway, &open, output));
            }
        }

        let stream = pipeline.render();
        let streamed = self
            .execute(&pipeline.gateway, &stream, "stream", cancel)
            .await
            .and_then(|output| {
                if output.success() {
                    Ok(())
                } else {
                    Err(self.failure(&pipeline.gateway, &stream, output))
                }
            });

        if let Some(tunnel) = &pipeline.tunnel {
            let close = RemoteCommand::on(pipeline.gateway.clone(), tunnel.close_command()).tolerant();
            if let Err(err) = self.run_command(&close, &CancellationToken::new()).await {
                warn!(gateway = %pipeline.gateway, error = %err, "failed to close tunnel");
            }
        }
        streamed?;

        for command in &pipeline.cleanup {
            self.run_command(command, cancel).await?;
        }
        info!(gateway = %pipeline.gateway, "pipeline finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use cloudhop_services::{
        CommandOutput, DryRunTransport, RemoteTransport, TransportError,
    };
    use tokio_util::sync::CancellationToken;

    use super::{
        Compression, ExecutorSettings, Pipeline, PipelineExecutor, RemoteCommand, Sink, Source,
        Tunnel,
    };
    use crate::error::TransferError;
    use crate::locks::KeyedLocks;

    fn tunneled_copy() -> Pipeline {
        Pipeline::new(
            "src-ctl",
            Source::BlockDevice {
                host: "src-compute".to_string(),
                path: "/dev/sdb".to_string(),
            },
            Sink::BlockDevice {
                host: "dst-compute".to_string(),
                path: "/dev/vdb".to_string(),
            },
        )
        .through(Tunnel {
            via: "dst-ctl".to_string(),
            target: "dst-compute".to_string(),
            local_port: 9999,
        })
    }

    fn executor(transport: Arc<dyn RemoteTransport>, settings: ExecutorSettings) -> PipelineExecutor {
        PipelineExecutor::new(transport, KeyedLocks::new(), settings)
    }

    #[test]
    fn renders_tunneled_direct_copy() {
        assert_eq!(
            tunneled_copy().render(),
            "set -o pipefail; ssh -oStrictHostKeyChecking=no src-compute 'dd bs=1M if=/dev/sdb' \
             | ssh -oStrictHostKeyChecking=no -p 9999 localhost 'dd bs=1M of=/dev/vdb'"
        );
    }

    #[test]
    fn renders_compressed_store_import() {
        let pipeline = Pipeline::new(
            "src-ctl",
            Source::BlockDevice {
                host: "src-compute".to_string(),
                path: "/dev/sdb".to_string(),
            },
            Sink::StoreImport {
                host: "dst-ctl".to_string(),
                pool: "volumes".to_string(),
                image: "volume-v2".to_string(),
            },
        )
        .compressed(Compression::Gzip { level: 7 });

        assert_eq!(
            pipeline.render(),
            "set -o pipefail; ssh -oStrictHostKeyChecking=no src-compute 'gzip -7 -c /dev/sdb' \
             | ssh -oStrictHostKeyChecking=no dst-ctl 'gunzip | rbd import --image-format=2 - volumes/volume-v2'"
        );
    }

    #[tokio::test]
    async fn opens_streams_and_closes_tunnel_in_order() {
        let transport = Arc::new(DryRunTransport::new());
        let pipeline = tunneled_copy().after_removing(RemoteCommand::on("dst-ctl", "rm -f stale").tolerant());

        executor(transport.clone(), ExecutorSettings::default())
            .run(&pipeline, &CancellationToken::new())
            .await
            .expect("pipeline");

        let issued: Vec<String> = transport.issued().into_iter().map(|c| c.command).collect();
        assert_eq!(issued.len(), 4);
        assert_eq!(issued[0], "rm -f stale");
        assert!(issued[1].contains("-f -N -L 9999:dst-compute:22 dst-ctl"));
        assert!(issued[2].starts_with("set -o pipefail;"));
        assert!(issued[3].starts_with("pkill -f"));
    }

    #[tokio::test]
    async fn failed_stream_still_closes_tunnel() {
        let transport = Arc::new(DryRunTransport::new());
        transport.reply_to("pipefail", CommandOutput::failed(1, "dd: No space left"));

        let err = executor(transport.clone(), ExecutorSettings::default())
            .run(&tunneled_copy(), &CancellationToken::new())
            .await
            .expect_err("stream fails");

        assert!(matches!(err, TransferError::RemoteCommandFailure { status: 1, .. }));
        assert_eq!(transport.commands_containing("pkill").len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_issues_nothing() {
        let transport = Arc::new(DryRunTransport::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor(transport.clone(), ExecutorSettings::default())
            .run(&tunneled_copy(), &cancel)
            .await
            .expect_err("cancelled");

        assert!(matches!(err, TransferError::Cancelled));
        assert!(transport.commands_containing("pipefail").is_empty());
    }

    struct StalledTransport;

    #[async_trait]
    impl RemoteTransport for StalledTransport {
        async fn execute(&self, _host: &str, _command: &str) -> Result<CommandOutput, TransportError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CommandOutput::ok(""))
        }
    }

    #[tokio::test]
    async fn stage_timeout_bounds_a_stuck_command() {
        let settings = ExecutorSettings {
            stage_timeout: Some(Duration::from_millis(20)),
            secrets: Vec::new(),
        };
        let err = executor(Arc::new(StalledTransport), settings)
            .run_command(&RemoteCommand::on("dst-ctl", "sleep 30"), &CancellationToken::new())
            .await
            .expect_err("timeout");

        assert!(matches!(err, TransferError::StageTimeout { .. }));
    }

    #[tokio::test]
    async fn secrets_are_masked_in_failures() {
        let transport = Arc::new(DryRunTransport::new());
        transport.reply_to("mysql", CommandOutput::failed(1, "denied for hunter2"));
        let settings = ExecutorSettings {
            stage_timeout: None,
            secrets: vec!["hunter2".to_string()],
        };

        let err = executor(transport, settings)
            .run_command(
                &RemoteCommand::on("dst-ctl", "mysql -phunter2 -e 'select 1'"),
                &CancellationToken::new(),
            )
            .await
            .expect_err("failure");

        let message = err.to_string();
        assert!(!message.contains("hunter2"));
        assert!(message.contains("-p***"));
    }

    fn tunneled_to(target: &str) -> Pipeline {
        Pipeline::new(
            "src-ctl",
            Source::BlockDevice {
                host: format!("src-{target}"),
                path: "/dev/sdb".to_string(),
            },
            Sink::BlockDevice {
                host: target.to_string(),
                path: "/dev/vdb".to_string(),
            },
        )
        .through(Tunnel {
            via: "dst-ctl".to_string(),
            target: target.to_string(),
            local_port: 9999,
        })
    }

    /// Counts forwards open on the gateway at once.
    #[derive(Default)]
    struct TunnelCounter {
        open: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTransport for TunnelCounter {
        async fn execute(&self, _host: &str, command: &str) -> Result<CommandOutput, TransportError> {
            if command.contains("-L 9999:") {
                let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
            } else if command.starts_with("pkill") {
                self.open.fetch_sub(1, Ordering::SeqCst);
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(CommandOutput::ok(""))
        }
    }

    #[test]
    fn tunneled_pipelines_share_the_gateway_port_key() {
        let first = tunneled_to("dst-compute-1").lock_keys();
        let second = tunneled_to("dst-compute-2").lock_keys();
        assert!(first.contains("tunnel:src-ctl:9999"));
        assert_eq!(first.intersection(&second).count(), 1);
    }

    #[tokio::test]
    async fn concurrent_tunnels_on_one_gateway_port_never_overlap() {
        let transport = Arc::new(TunnelCounter::default());
        let executor = executor(transport.clone(), ExecutorSettings::default());
        let cancel = CancellationToken::new();
        let (first, second) = (tunneled_to("dst-compute-1"), tunneled_to("dst-compute-2"));

        let (a, b) = tokio::join!(executor.run(&first, &cancel), executor.run(&second, &cancel));
        a.expect("first pipeline");
        b.expect("second pipeline");

        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }
}
