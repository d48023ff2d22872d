use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use cloudhop_contract::MigrationRequest;
use cloudhop_control_plane::{build_router, AppState, ControlSettings};
use cloudhop_services::{
    CloudServices, DestinationCloud, DryRunTransport, InMemoryCloud, MysqlPatcher, RemoteTransport,
    SourceCloud, SshSettings, SshTransport,
};
use cloudhop_storage::{MigrationStorage, StorageConfig};
use cloudhop_workflow::{MigrationConfig, MigrationDeps, MigrationRuntime};
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Cloud-to-cloud instance migration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Migrate one instance and wait for the outcome.
    Migrate {
        #[arg(long, default_value = "config/cloudhop.toml")]
        config: PathBuf,
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Continue a stored run from its last checkpoint.
    Resume {
        #[arg(long, default_value = "config/cloudhop.toml")]
        config: PathBuf,
        #[arg(long)]
        run_id: String,
        /// Fresher request replacing the stored one.
        #[arg(long)]
        request: Option<PathBuf>,
    },
    Serve {
        #[arg(long, default_value = "config/cloudhop.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    storage: StorageSection,
    #[serde(default)]
    http: HttpSection,
    #[serde(default)]
    transport: TransportSection,
    #[serde(default)]
    stand_in: StandInSection,
    #[serde(flatten)]
    migration: MigrationConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    auth_token: Option<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum TransportMode {
    Ssh,
    #[default]
    DryRun,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TransportSection {
    #[serde(default)]
    mode: TransportMode,
    user: Option<String>,
    identity_file: Option<PathBuf>,
    connect_timeout_secs: Option<u64>,
}

/// Catalog seeded into the in-memory clouds that stand in for the service
/// APIs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StandInSection {
    flavors: BTreeMap<String, String>,
    tenants: BTreeMap<String, String>,
    networks: BTreeMap<String, String>,
    security_groups: BTreeMap<String, String>,
    source_images: Vec<SeedImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedImage {
    id: String,
    name: String,
    content: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Migrate {
            config,
            request,
            run_id,
        } => migrate(config, request, run_id).await,
        Command::Resume {
            config,
            run_id,
            request,
        } => resume(config, run_id, request).await,
        Command::Serve { config } => serve(config).await,
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "cloudhopd failed");
            ExitCode::FAILURE
        }
    }
}

async fn migrate(config_path: PathBuf, request_path: PathBuf, run_id: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    let request = load_request(&request_path)?;
    let runtime = build_runtime(&config).await?;
    cancel_on_interrupt(&runtime);

    let run = runtime.submit(&request, run_id.as_deref()).await?;
    let instance = runtime.execute(&run.run_id, None).await?;
    info!(run_id = %run.run_id, instance_id = %instance.id, "migration complete");
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}

async fn resume(config_path: PathBuf, run_id: String, request_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path)?;
    let supplied = request_path.as_deref().map(load_request).transpose()?;
    let runtime = build_runtime(&config).await?;
    cancel_on_interrupt(&runtime);

    let instance = runtime.execute(&run_id, supplied).await?;
    info!(run_id = %run_id, instance_id = %instance.id, "migration resumed to completion");
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;

    let require_bearer = requires_token(&config.http.bind);
    if require_bearer && config.http.auth_token.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires http.auth_token",
            config.http.bind
        ));
    }

    if !require_bearer {
        info!("loopback bind detected: bearer auth optional");
    } else {
        warn!("non-loopback bind detected: bearer auth enforced");
    }

    let runtime = build_runtime(&config).await?;
    let interrupted = runtime
        .storage()
        .fail_interrupted("interrupted by daemon restart")
        .await?;
    if interrupted > 0 {
        warn!(runs = interrupted, "runs left running by a previous daemon marked failed; resume them explicitly");
    }
    let settings = ControlSettings {
        http_bind: config.http.bind.clone(),
        http_auth_token: config.http.auth_token.clone(),
    };
    let state = AppState::new(runtime.clone(), settings, require_bearer);
    state.spawn_event_relay();
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "cloudhopd control-plane listening");
    let cancel = runtime.deps().cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, cancelling running migrations");
            cancel.cancel();
        })
        .await
        .context("axum server failed")
}

fn load_config(path: &std::path::Path) -> Result<RuntimeConfig> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: RuntimeConfig = toml::from_str(&source)
        .with_context(|| format!("invalid config TOML at {}", path.display()))?;
    config
        .migration
        .validate()
        .with_context(|| format!("rejected config {}", path.display()))?;
    Ok(config)
}

fn load_request(path: &std::path::Path) -> Result<MigrationRequest> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    serde_json::from_str(&source)
        .with_context(|| format!("invalid migration request JSON at {}", path.display()))
}

async fn build_runtime(config: &RuntimeConfig) -> Result<MigrationRuntime> {
    let storage = MigrationStorage::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await?;

    let transport: Arc<dyn RemoteTransport> = match config.transport.mode {
        TransportMode::Ssh => Arc::new(SshTransport::new(SshSettings {
            user: config.transport.user.clone(),
            identity_file: config.transport.identity_file.clone(),
            forward_agent: config.migration.pipeline.forward_agent,
            connect_timeout: config.transport.connect_timeout_secs.map(Duration::from_secs),
        })),
        TransportMode::DryRun => {
            warn!("dry-run transport: remote commands are recorded, not executed");
            Arc::new(DryRunTransport::new())
        }
    };

    let services = stand_in_services(&config.stand_in, &config.migration, transport);
    let deps = MigrationDeps::new(Arc::new(config.migration.clone()), services);
    Ok(MigrationRuntime::new(deps, storage))
}

fn stand_in_services(
    seed: &StandInSection,
    migration: &MigrationConfig,
    transport: Arc<dyn RemoteTransport>,
) -> CloudServices {
    let source = Arc::new(InMemoryCloud::new());
    for image in &seed.source_images {
        source.add_image(&image.id, &image.name, image.content.as_bytes());
    }

    let destination = Arc::new(InMemoryCloud::new());
    for (id, name) in &seed.flavors {
        destination.add_flavor(id, name);
    }
    for (name, id) in &seed.tenants {
        destination.add_tenant(name, id);
    }
    for (id, name) in &seed.networks {
        destination.add_network(id, name);
    }
    for (id, name) in &seed.security_groups {
        destination.add_security_group(id, name);
    }

    let database = Arc::new(MysqlPatcher::new(
        transport.clone(),
        migration.destination.gateway.clone(),
        migration.destination.database.user.clone(),
        migration.destination.database.password.clone(),
    ));

    CloudServices {
        source: SourceCloud {
            images: source.clone(),
            volumes: source,
        },
        destination: DestinationCloud {
            compute: destination.clone(),
            volumes: destination.clone(),
            images: destination.clone(),
            network: destination.clone(),
            identity: destination,
            database,
        },
        transport,
    }
}

fn cancel_on_interrupt(runtime: &MigrationRuntime) {
    let cancel = runtime.deps().cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current command");
            cancel.cancel();
        }
    });
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use cloudhop_contract::MigrationRequest;

    use super::{requires_token, RuntimeConfig, TransportMode};

    #[test]
    fn only_loopback_binds_skip_auth() {
        assert!(!requires_token("127.0.0.1:8080"));
        assert!(!requires_token("[::1]:8080"));
        assert!(requires_token("0.0.0.0:8080"));
        assert!(requires_token("not-an-address"));
    }

    #[test]
    fn sample_files_parse() {
        let config: RuntimeConfig =
            toml::from_str(include_str!("../../../config/cloudhop.toml")).expect("config");
        assert_eq!(config.transport.mode, TransportMode::DryRun);
        assert_eq!(config.migration.source.gateway, "src-ctl.example");
        assert_eq!(config.migration.destination.speed_limit, Some(10 * 1024 * 1024));
        assert_eq!(config.stand_in.flavors.get("fl-small").map(String::as_str), Some("m1.small"));
        assert!(config.migration.validate().is_ok());

        let request: MigrationRequest =
            serde_json::from_str(include_str!("../../../config/request.sample.json")).expect("request");
        assert_eq!(request.name, "web-01");
        assert_eq!(request.volumes.len(), 1);
    }
}
