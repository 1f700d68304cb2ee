//! Binary entry point for the `longhorn-br` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

use longhorn_br::{
    BackupError, BackupOrchestrator, BackupRestoreConfig, CancelHandle, CancelToken, ClusterError,
    ConfigError, KubeClient, LonghornClient, RestoreError, RestoreOrchestrator, StorageApi,
    StorageApiError,
};

mod cli;

use cli::{Cli, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cluster client error: {0}")]
    Cluster(#[from] ClusterError),
    #[error("storage client error: {0}")]
    Storage(#[from] StorageApiError),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn resolve_config(cli: &Cli) -> Result<BackupRestoreConfig, CliError> {
    let mut config = BackupRestoreConfig::load_without_cli_args()?;
    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut BackupRestoreConfig, cli: &Cli) {
    if let Some(endpoint) = &cli.api_endpoint {
        config.api_endpoint = Some(endpoint.clone());
    }
    if let Some(path) = &cli.kubeconfig {
        config.kubeconfig = path.to_string();
    }
    let (Command::Backup(args) | Command::Restore(args)) = &cli.command;
    if let Some(path) = &args.artifact {
        config.artifact_path = path.to_string();
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = resolve_config(&cli)?;
    let storage = LonghornClient::new(
        config.api_endpoint().unwrap_or_default(),
        &config.fs_type,
        config.http_timeout(),
    )?;
    storage.probe().await?;
    let cluster = KubeClient::from_kubeconfig(&config.kubeconfig_path(), config.http_timeout())?;
    let cancel = cancel_on_interrupt();
    let artifact = config.artifact_path();

    match cli.command {
        Command::Backup(_) => {
            let orchestrator = BackupOrchestrator::new(
                cluster,
                storage,
                &config.namespace,
                &config.storage_class,
            )
            .with_poll_policies(config.poll_policies());
            let summary = orchestrator.execute_to_path(&artifact, &cancel).await?;
            info!(
                volumes = summary.volumes,
                claims = summary.claims,
                claims_filtered = summary.claims_filtered,
                artifact = %artifact,
                "backup complete"
            );
        }
        Command::Restore(_) => {
            let orchestrator = RestoreOrchestrator::new(cluster, storage, &config.namespace)
                .with_volume_wait(config.poll_policies().volume);
            let summary = orchestrator.execute_from_path(&artifact, &cancel).await?;
            info!(
                volumes_created = summary.volumes_created,
                volumes_skipped = summary.volumes_skipped,
                claims = summary.claims_restored,
                records_skipped = summary.records_skipped,
                "restore complete"
            );
        }
    }
    Ok(())
}

fn cancel_on_interrupt() -> CancelToken {
    let handle = CancelHandle::new();
    let token = handle.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            handle.cancel();
        }
    });
    token
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
