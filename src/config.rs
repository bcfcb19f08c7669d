//! Configuration management for busauth.
//!
//! Configuration is loaded from multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (`BUSAUTH__<SECTION>__<KEY>`)
//! 4. Command-line arguments
//!
//! Later sources override earlier ones.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BusResult;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments shared by every subcommand.
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "BUSAUTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bus identifier (overrides `access_control.bus_id`)
    #[arg(long)]
    pub bus_id: Option<String>,

    /// Lease duration in seconds (overrides `access_control.lease_secs`)
    #[arg(long)]
    pub lease_secs: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub access_control: AccessControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Caller-side sessions kept per connection
    #[serde(default = "default_max_outbound_sessions")]
    pub max_outbound_sessions: usize,
    /// Server-side sessions kept per connection
    #[serde(default = "default_max_inbound_sessions")]
    pub max_inbound_sessions: usize,
    /// Joined chains cached per session
    #[serde(default = "default_max_joined_chains")]
    pub max_joined_chains: usize,
    /// Retries after a credential reset
    #[serde(default = "default_reset_retries")]
    pub reset_retries: u32,
    /// Operations accepted (server) or sent (client) without credentials
    #[serde(default)]
    pub unauthenticated_operations: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_outbound_sessions: default_max_outbound_sessions(),
            max_inbound_sessions: default_max_inbound_sessions(),
            max_joined_chains: default_max_joined_chains(),
            reset_retries: default_reset_retries(),
            unauthenticated_operations: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn is_unauthenticated(&self, operation: &str) -> bool {
        self.unauthenticated_operations.iter().any(|op| op == operation)
    }
}

/// Settings for the in-memory access-control service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlConfig {
    #[serde(default = "default_bus_id")]
    pub bus_id: String,
    /// Lease granted on login and renewal
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u32,
    /// Extra time a login survives past its lease
    #[serde(default = "default_lease_grace_secs")]
    pub lease_grace_secs: u32,
    #[serde(default = "default_handoff_ttl_secs")]
    pub shared_auth_ttl_secs: u32,
    #[serde(default = "default_handoff_ttl_secs")]
    pub challenge_ttl_secs: u32,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            bus_id: default_bus_id(),
            lease_secs: default_lease_secs(),
            lease_grace_secs: default_lease_grace_secs(),
            shared_auth_ttl_secs: default_handoff_ttl_secs(),
            challenge_ttl_secs: default_handoff_ttl_secs(),
            users: Vec::new(),
        }
    }
}

impl AccessControlConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_secs))
    }

    /// How long a login stays valid after a grant or renewal.
    pub fn login_validity(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_secs) + u64::from(self.lease_grace_secs))
    }

    pub fn shared_auth_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.shared_auth_ttl_secs))
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.challenge_ttl_secs))
    }
}

/// Password entry for the in-memory access-control service.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub entity: String,
    pub password: String,
    /// Restricts the entry to one authentication domain
    #[serde(default)]
    pub domain: Option<String>,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("entity", &self.entity)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

impl BusConfig {
    /// Load configuration from the embedded defaults, an optional file and
    /// the environment.
    pub fn load(path: Option<&Path>) -> BusResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BUSAUTH")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("connection.unauthenticated_operations")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load from all sources, then apply command-line overrides.
    pub fn from_args(args: &Args) -> BusResult<Self> {
        let mut config = Self::load(args.config.as_deref())?;
        if let Some(bus_id) = &args.bus_id {
            config.access_control.bus_id = bus_id.clone();
        }
        if let Some(lease) = args.lease_secs {
            config.access_control.lease_secs = lease;
        }
        if let Some(level) = &args.log_level {
            config.logging.level = level.clone();
        }
        Ok(config)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            access_control: AccessControlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_max_outbound_sessions() -> usize {
    1024
}

fn default_max_inbound_sessions() -> usize {
    4096
}

fn default_max_joined_chains() -> usize {
    64
}

fn default_reset_retries() -> u32 {
    1
}

fn default_bus_id() -> String {
    "local-bus".to_string()
}

fn default_lease_secs() -> u32 {
    60
}

fn default_lease_grace_secs() -> u32 {
    30
}

fn default_handoff_ttl_secs() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_load() -> BusResult<()> {
        let config = BusConfig::load(None)?;
        assert_eq!(config.connection.reset_retries, 1);
        assert!(config.access_control.lease_secs > 0);
        assert!(config.access_control.users.iter().any(|u| u.entity == "alice"));
        Ok(())
    }

    #[test]
    fn test_file_overrides_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "[access_control]\nbus_id = \"bus-from-file\"\nlease_secs = 5")?;
        let config = BusConfig::load(Some(file.path()))?;
        assert_eq!(config.access_control.bus_id, "bus-from-file");
        assert_eq!(config.access_control.lease_secs, 5);
        assert_eq!(config.access_control.lease_grace_secs, 30);
        Ok(())
    }

    #[test]
    fn test_args_override_file() -> BusResult<()> {
        let args = Args {
            config: None,
            bus_id: Some("cli-bus".into()),
            lease_secs: Some(7),
            log_level: Some("debug".into()),
        };
        let config = BusConfig::from_args(&args)?;
        assert_eq!(config.access_control.bus_id, "cli-bus");
        assert_eq!(config.access_control.lease_secs, 7);
        assert_eq!(config.logging.level, "debug");
        Ok(())
    }

    #[test]
    fn test_user_entry_debug_hides_password() {
        let entry = UserEntry {
            entity: "alice".into(),
            password: "hunter2".into(),
            domain: None,
        };
        assert!(!format!("{entry:?}").contains("hunter2"));
    }
}
