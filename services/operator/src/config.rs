//! Configuration for the operator.
//!
//! Two layers: process settings read straight from the environment, and
//! controller settings loaded with the `config` crate from an optional TOML
//! file overlaid with `OCTI_`-prefixed environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use octi_reconcile::config::{
    DEFAULT_HEALTH_BUDGET, DEFAULT_HEALTH_INTERVAL, DEFAULT_PLATFORM_PORT, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_WORKER_COUNT,
};
use octi_reconcile::connector::ProxySettings;
use octi_reconcile::ControllerConfig;
use serde::Deserialize;

/// Prefix of every environment variable the operator reads.
pub const ENV_PREFIX: &str = "OCTI";

/// Operator process configuration.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Supervisor API socket of the workload container.
    pub socket_path: PathBuf,

    /// Directory holding the local state database.
    pub state_dir: PathBuf,

    /// Optional TOML file with controller settings.
    pub settings_file: Option<PathBuf>,

    /// Command the degraded health watcher runs once the platform is up.
    pub notify_command: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Model proxy settings handed to connector workloads.
    pub proxy: ProxySettings,
}

impl OperatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let socket_path = std::env::var("OCTI_SOCKET_PATH")
            .unwrap_or_else(|_| "/charm/containers/opencti/pebble.socket".to_string())
            .into();

        let state_dir = std::env::var("OCTI_STATE_DIR")
            .unwrap_or_else(|_| "/var/lib/octi-operator".to_string())
            .into();

        let settings_file = std::env::var("OCTI_SETTINGS_FILE").ok().map(PathBuf::from);

        let notify_command = std::env::var("OCTI_NOTIFY_COMMAND")
            .ok()
            .filter(|c| !c.trim().is_empty());

        let log_level = std::env::var("OCTI_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let proxy = ProxySettings {
            http: std::env::var("JUJU_CHARM_HTTP_PROXY").ok(),
            https: std::env::var("JUJU_CHARM_HTTPS_PROXY").ok(),
            no_proxy: std::env::var("JUJU_CHARM_NO_PROXY").ok(),
        };

        Ok(Self {
            socket_path,
            state_dir,
            settings_file,
            notify_command,
            log_level,
            proxy,
        })
    }

    /// Path of the SQLite state database.
    pub fn state_db(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }
}

/// Controller settings as an operator writes them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub admin_user: Option<String>,
    pub worker_count: u32,
    pub platform_port: u16,
    pub health_budget_secs: u64,
    pub health_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub account_prefix: String,
    pub elevated_group: String,
    pub restricted_group: String,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            app_name: defaults.app_name,
            admin_user: None,
            worker_count: DEFAULT_WORKER_COUNT,
            platform_port: DEFAULT_PLATFORM_PORT,
            health_budget_secs: DEFAULT_HEALTH_BUDGET.as_secs(),
            health_interval_secs: DEFAULT_HEALTH_INTERVAL.as_secs(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            account_prefix: defaults.account_prefix,
            elevated_group: defaults.elevated_group,
            restricted_group: defaults.restricted_group,
        }
    }
}

impl Settings {
    /// Load settings from the optional file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with(file, config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Load settings with an explicit environment source.
    pub fn load_with(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(env)
            .build()
            .context("failed to load settings")?
            .try_deserialize()
            .context("invalid settings")?;
        Ok(settings)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            app_name: self.app_name.clone(),
            admin_user: self.admin_user.clone().filter(|s| !s.is_empty()),
            worker_count: self.worker_count,
            platform_port: self.platform_port,
            health_budget: Duration::from_secs(self.health_budget_secs),
            health_interval: Duration::from_secs(self.health_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            account_prefix: self.account_prefix.clone(),
            elevated_group: self.elevated_group.clone(),
            restricted_group: self.restricted_group.clone(),
        }
    }
}
