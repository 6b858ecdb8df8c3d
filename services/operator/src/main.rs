//! OpenCTI operator
//!
//! Invoked by the host once per event. Each invocation reads the host's
//! snapshot, runs one level-triggered reconcile against the workload
//! container and writes back the relation data to publish.
//!
//! ## Commands
//!
//! - **reconcile**: converge the platform workload
//! - **connector**: converge a connector workload
//! - **wait-healthy**: degraded helper polling the platform until it is up

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use octi_reconcile::connector::lookup;
use octi_reconcile::{Collaborators, ConnectorReconciler, HealthWatcher, RelationPeerStore};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use octi_operator::host::{
    self, ConnectorInput, ConnectorReport, HostEvent, HostInput, HostReport,
};
use octi_operator::{
    GraphqlDirectoryProvider, HelperLock, HttpProbe, LocalSecretStore, LogStatusSink,
    OperatorConfig, PebbleClient, Settings, SpawnWatcher, StateStore,
};

/// OpenCTI operator host adapter.
#[derive(Debug, Parser)]
#[command(name = "octi-operator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the platform workload once.
    Reconcile {
        /// Host snapshot (JSON).
        #[arg(long, env = "OCTI_SNAPSHOT")]
        snapshot: PathBuf,

        /// Where to write the report; stdout when omitted.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Host event that triggered this invocation.
        #[arg(long, default_value = "update-status")]
        event: String,

        /// File receiving interim status while the platform starts.
        #[arg(long)]
        status_file: Option<PathBuf>,
    },

    /// Reconcile a connector workload once.
    Connector {
        /// Connector name from the catalog.
        #[arg(long)]
        name: String,

        /// Connector input (JSON).
        #[arg(long)]
        input: PathBuf,

        /// Where to write the report; stdout when omitted.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Poll the platform until healthy, then run a notify command.
    WaitHealthy {
        /// Health URL. Carries the access key, so it is usually passed
        /// through the environment.
        #[arg(long, env = "OCTI_WATCH_URL", hide_env_values = true)]
        url: String,

        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        /// Give up after this many probes.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Shell command run once the platform is healthy.
        #[arg(long)]
        notify: String,

        /// Pid file keeping a second helper from starting.
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OperatorConfig::from_env()?;

    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Reconcile {
            snapshot,
            report,
            event,
            status_file,
        } => reconcile(&config, snapshot, report, &event, status_file).await,
        Commands::Connector {
            name,
            input,
            report,
        } => connector(&config, &name, input, report).await,
        Commands::WaitHealthy {
            url,
            interval_secs,
            max_attempts,
            notify,
            pid_file,
        } => {
            let _lock = match pid_file {
                Some(path) => match HelperLock::acquire(&path)? {
                    Some(lock) => Some(lock),
                    None => {
                        info!(pid_file = %path.display(), "health watcher already running");
                        return Ok(());
                    }
                },
                None => None,
            };
            let probe = HttpProbe::new(Duration::from_secs(5))?;
            octi_operator::health::wait_healthy(
                &probe,
                &url,
                Duration::from_secs(interval_secs),
                max_attempts,
                &notify,
            )
            .await
        }
    }
}

fn open_state(config: &OperatorConfig) -> Result<Arc<StateStore>> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;
    let store = StateStore::open(config.state_db()).context("failed to open state store")?;
    Ok(Arc::new(store))
}

fn emit<T: serde::Serialize>(path: Option<PathBuf>, value: &T) -> Result<()> {
    match path {
        Some(path) => host::write_json(&path, value),
        None => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(())
        }
    }
}

async fn reconcile(
    config: &OperatorConfig,
    snapshot: PathBuf,
    report: Option<PathBuf>,
    event: &str,
    status_file: Option<PathBuf>,
) -> Result<()> {
    let settings = Settings::load(config.settings_file.as_deref())?;
    let controller_config = settings.controller_config();
    let event: HostEvent = event.parse()?;
    let input: HostInput = host::read_json(&snapshot)?;
    info!(
        event = %event,
        app = %controller_config.app_name,
        socket = %config.socket_path.display(),
        "Configuration loaded"
    );

    let store = open_state(config)?;
    store.sync_secrets(&input.secrets)?;

    let supervisor = PebbleClient::new(&config.socket_path);
    let probe = HttpProbe::new(controller_config.probe_timeout)?;
    let secrets = LocalSecretStore::new(Arc::clone(&store));
    let peer = RelationPeerStore::from_snapshot(&input.snapshot);
    let sink = LogStatusSink::new(status_file);
    let watcher = match &config.notify_command {
        Some(command) => Some(SpawnWatcher::new(
            std::env::current_exe().context("failed to locate operator binary")?,
            command.clone(),
            controller_config.health_interval,
            config.state_dir.clone(),
        )),
        None => None,
    };

    let deps = Collaborators {
        supervisor: &supervisor,
        probe: &probe,
        secrets: &secrets,
        peer: &peer,
        directory: &GraphqlDirectoryProvider,
        sink: &sink,
        watcher: watcher.as_ref().map(|w| w as &dyn HealthWatcher),
    };

    match host::handle_event(&controller_config, deps, &event, &input.snapshot).await {
        Ok(outcome) => {
            let report_doc = HostReport::new(&event, &outcome, &peer, store.pending_ops()?);
            emit(report, &report_doc)?;
            if let Some(seq) = report_doc.journal_seq() {
                store.acknowledge_ops(seq)?;
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "reconcile failed");
            Err(e.into())
        }
    }
}

async fn connector(
    config: &OperatorConfig,
    name: &str,
    input: PathBuf,
    report: Option<PathBuf>,
) -> Result<()> {
    let Some(kind) = lookup(name) else {
        bail!("unknown connector: {name}");
    };
    let input: ConnectorInput = host::read_json(&input)?;

    let store = open_state(config)?;
    store.sync_secrets(&input.secrets)?;

    let supervisor = PebbleClient::new(&config.socket_path);
    let secrets = LocalSecretStore::new(Arc::clone(&store));
    let outcome = ConnectorReconciler::new(kind, &secrets, &supervisor)
        .reconcile(input.role, input.relation.as_ref(), &input.settings(&config.proxy))
        .await?;
    info!(connector = name, status = %outcome.result, "connector reconciled");
    emit(report, &ConnectorReport::from(&outcome))
}
