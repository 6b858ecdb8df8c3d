//! Controller configuration.

use std::time::Duration;

use crate::ReconcileError;

/// Application name the platform reserves for itself.
pub const RESERVED_APP_NAME: &str = "x-opencti";

/// Default number of worker services.
pub const DEFAULT_WORKER_COUNT: u32 = 3;

/// Default platform HTTP port.
pub const DEFAULT_PLATFORM_PORT: u16 = 8080;

/// Default health polling budget.
pub const DEFAULT_HEALTH_BUDGET: Duration = Duration::from_secs(200);

/// Default pause between health probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout of a single health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration consumed by one reconcile invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Local application name; also the search index prefix and the
    /// message broker user name.
    pub app_name: String,

    /// Secret reference holding the initial admin `email` and `password`.
    pub admin_user: Option<String>,

    /// Number of worker services started after the platform is healthy.
    pub worker_count: u32,

    /// Port the platform listens on inside the workload.
    pub platform_port: u16,

    /// Total time allowed for the platform to pass its health check.
    pub health_budget: Duration,

    /// Pause between health probes.
    pub health_interval: Duration,

    /// Timeout of a single health probe request.
    pub probe_timeout: Duration,

    /// Name prefix for accounts provisioned for connector integrations.
    pub account_prefix: String,

    /// Group for connectors that export platform data.
    pub elevated_group: String,

    /// Group for every other connector.
    pub restricted_group: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            app_name: "opencti".to_string(),
            admin_user: None,
            worker_count: DEFAULT_WORKER_COUNT,
            platform_port: DEFAULT_PLATFORM_PORT,
            health_budget: DEFAULT_HEALTH_BUDGET,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            account_prefix: "connector-".to_string(),
            elevated_group: "Administrators".to_string(),
            restricted_group: "Connectors".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Check options that do not depend on any collaborator.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.app_name == RESERVED_APP_NAME {
            return Err(ReconcileError::InvalidConfig(format!(
                "application name cannot be {RESERVED_APP_NAME}"
            )));
        }
        if self.worker_count == 0 {
            return Err(ReconcileError::InvalidConfig(
                "worker-count must be at least 1".to_string(),
            ));
        }
        if self.account_prefix.is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "account-prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL the platform serves on inside the workload.
    pub fn platform_url(&self) -> String {
        format!("http://localhost:{}", self.platform_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Disposition;

    #[test]
    fn test_default_is_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.platform_url(), "http://localhost:8080");
    }

    #[test]
    fn test_reserved_app_name_blocks() {
        let config = ControllerConfig {
            app_name: RESERVED_APP_NAME.to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.disposition(), Disposition::Blocked);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ControllerConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
