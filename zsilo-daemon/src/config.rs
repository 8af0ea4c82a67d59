//! Daemon configuration.
//!
//! A single JSON document read from a file (or stdin) at startup. Missing
//! fields fall back to defaults; `validate` enforces what has no sensible
//! default, in particular remote SSH credentials and the host identity.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub log: LogConfig,
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub command: CommandConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "INFO".to_string(), format: "JSON".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub bind_address: String,
    /// Serve with a self-signed certificate. Disabled only in tests.
    pub tls: bool,
    pub keys: Vec<KeyConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0:8080".to_string(), tls: true, keys: Vec::new() }
    }
}

/// One bearer token and the identity it authenticates as.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfig {
    pub identity: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandConfig {
    pub produce_target: TargetConfig,
    pub consume_targets: Vec<ConsumeTargetConfig>,
    pub host: HostConfig,
    pub credentials: CredentialsConfig,
    /// Root pool whose free space answers `GetCapacity`.
    pub pool: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            produce_target: TargetConfig::default(),
            consume_targets: Vec::new(),
            host: HostConfig::default(),
            credentials: CredentialsConfig::default(),
            pool: "tank".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub run_as_root: bool,
    pub remote: RemoteTargetConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTargetConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for RemoteTargetConfig {
    fn default() -> Self {
        Self { address: String::new(), port: 22, username: String::new(), password: String::new() }
    }
}

/// A consumer host, tagged with the initiator IQN it connects as.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeTargetConfig {
    #[serde(flatten)]
    pub target: TargetConfig,
    pub iqn: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub domain: String,
    pub owner_time: DateTime<Utc>,
    pub hostname: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            // The linux-iscsi.org domain establish time of 01 2006.
            domain: "linux-iscsi.org".to_string(),
            owner_time: Utc.with_ymd_and_hms(2006, 1, 1, 0, 0, 0).unwrap(),
            hostname: String::new(),
        }
    }
}

/// CHAP credentials shared by every target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub mutual_user_id: String,
    #[serde(default)]
    pub mutual_password: String,
}

impl Config {
    /// Read and validate the configuration from a file path, or from stdin
    /// when the path is `-`.
    pub fn load(path: &str) -> Result<Self> {
        let data = if path == "-" {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer).context("failed to read from stdin")?;
            buffer
        } else {
            std::fs::read_to_string(path).context("failed to read config file")?
        };

        let config: Config =
            serde_json::from_str(&data).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.log.level.as_str() {
            "DEBUG" | "INFO" | "WARN" | "ERROR" => {}
            other => bail!("unsupported log level {other}"),
        }
        match self.log.format.as_str() {
            "JSON" | "TEXT" => {}
            other => bail!("unsupported log format {other}"),
        }

        if self.database.dsn.is_empty() {
            bail!("database.dsn is required");
        }
        if self.command.host.hostname.is_empty() {
            bail!("command.host.hostname is required");
        }
        if self.command.pool.is_empty() {
            bail!("command.pool is required");
        }

        validate_target(&self.command.produce_target, "command.produceTarget")?;
        for (index, consume) in self.command.consume_targets.iter().enumerate() {
            let context = format!("command.consumeTargets[{index}]");
            if consume.iqn.is_empty() {
                bail!("{context}.iqn is required");
            }
            validate_target(&consume.target, &context)?;
        }

        Ok(())
    }
}

fn validate_target(target: &TargetConfig, context: &str) -> Result<()> {
    if target.kind == TargetType::Remote {
        if target.remote.address.is_empty() {
            bail!("{context}.remote.address is required for remote targets");
        }
        if target.remote.username.is_empty() {
            bail!("{context}.remote.username is required for remote targets");
        }
        if target.remote.password.is_empty() {
            bail!("{context}.remote.password is required for remote targets");
        }
    }
    Ok(())
}
