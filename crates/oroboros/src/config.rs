//! # Server Configuration
//!
//! ```toml
//! bind = "127.0.0.1:8080"
//! service_token = "change-me-service"
//! admin_token = "change-me-admin"
//! ledger_config = "config/ledger.toml"
//! factory_config = "config/factory.toml"
//! maintenance_interval_secs = 60
//! reconcile_after_secs = 300
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::error::ServerError;

/// Longest accepted `reconcile_after_secs` (one year).
pub const MAX_RECONCILE_AFTER_SECS: u64 = 365 * 24 * 60 * 60;

/// Settings of the `oroboros_server` binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Token of backend services; service endpoints are closed when absent.
    pub service_token: Option<String>,
    /// Token of operators; `adjust` is closed when absent.
    pub admin_token: Option<String>,
    /// Path of the ledger TOML.
    pub ledger_config: PathBuf,
    /// Path of the scheduler TOML.
    pub factory_config: PathBuf,
    /// Period of the reconciliation and snapshot job.
    pub maintenance_interval_secs: u64,
    /// Age after which a `pending` task is compensated.
    pub reconcile_after_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            service_token: None,
            admin_token: None,
            ledger_config: PathBuf::from("config/ledger.toml"),
            factory_config: PathBuf::from("config/factory.toml"),
            maintenance_interval_secs: 60,
            reconcile_after_secs: 300,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on malformed TOML or inconsistent values.
    pub fn from_toml_str(text: &str) -> Result<Self, ServerError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ServerError> {
        if self.maintenance_interval_secs == 0 {
            return Err(ServerError::InvalidConfig(
                "maintenance_interval_secs must be positive".to_string(),
            ));
        }
        if self.reconcile_after_secs > MAX_RECONCILE_AFTER_SECS {
            return Err(ServerError::InvalidConfig(format!(
                "reconcile_after_secs must be at most {MAX_RECONCILE_AFTER_SECS}"
            )));
        }
        for token in [&self.service_token, &self.admin_token].into_iter().flatten() {
            if token.trim().is_empty() {
                return Err(ServerError::InvalidConfig("tokens must not be blank".to_string()));
            }
        }
        if self.service_token.is_some() && self.service_token == self.admin_token {
            return Err(ServerError::InvalidConfig(
                "service and admin tokens must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// The tokens requests are checked against.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            service_token: self.service_token.clone(),
            admin_token: self.admin_token.clone(),
        }
    }

    /// Period of the maintenance job.
    #[must_use]
    pub const fn maintenance_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Age after which a pending task is considered abandoned.
    #[must_use]
    pub fn reconcile_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile_after_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = ServerConfig::from_toml_str(r#"bind = "0.0.0.0:9000""#).unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.ledger_config, PathBuf::from("config/ledger.toml"));
        assert_eq!(config.credentials(), Credentials::default());
    }

    #[test]
    fn test_shared_token_rejected() {
        let text = r#"
            service_token = "same"
            admin_token = "same"
        "#;
        assert!(ServerConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(ServerConfig::from_toml_str("maintenance_interval_secs = 0").is_err());
    }
}
