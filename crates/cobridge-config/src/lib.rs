//! Configuration for the cobridge binary.
//!
//! A TOML file layered under environment overrides via figment, describing
//! the shared endpoint and the devices it serves, plus the [`FileStore`]
//! that keeps each device's cloud state across restarts.

mod store;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use cobridge_core::{CloudManagerConfig, ConfigurationUpdate};

pub use store::FileStore;

/// Built-in paths no configured resource may claim.
const RESERVED_PATHS: &[&str] = &["/oic/d", "/oic/res", "/CoapCloudConfResURI"];

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("state file {path} is corrupt: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// UDP address the shared CoAP endpoint binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,

    /// Overrides the platform state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            reconnect_interval_secs: default_reconnect_interval(),
            step_timeout_secs: default_step_timeout(),
            refresh_margin_secs: default_refresh_margin(),
            state_dir: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5683".into()
}
fn default_reconnect_interval() -> u64 {
    10
}
fn default_step_timeout() -> u64 {
    10
}
fn default_refresh_margin() -> u64 {
    300
}

impl RuntimeConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| {
            ConfigError::validation(
                "runtime.listen",
                format!("not a socket address: {}", self.listen),
            )
        })
    }

    /// Timer and timeout settings handed to every cloud manager.
    pub fn manager_config(&self) -> CloudManagerConfig {
        CloudManagerConfig {
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            refresh_margin: Duration::from_secs(self.refresh_margin_secs),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }
}

/// One served device.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Stable device id; persisted state is keyed by it.
    pub id: Uuid,

    #[serde(default = "default_device_types")]
    pub device_types: Vec<String>,

    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Initial cloud configuration, used only when no state was persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudBootstrap>,
}

fn default_device_types() -> Vec<String> {
    vec!["oic.wk.d".into()]
}

/// A resource holding one JSON-shaped value, served as CBOR.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceConfig {
    pub href: String,

    #[serde(default)]
    pub rt: Vec<String>,

    #[serde(rename = "if", default = "default_interfaces")]
    pub interfaces: Vec<String>,

    #[serde(default)]
    pub observable: bool,

    /// Whether the resource is published to the cloud resource directory.
    #[serde(default = "default_publish")]
    pub publish: bool,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

fn default_interfaces() -> Vec<String> {
    vec!["oic.if.baseline".into()]
}
fn default_publish() -> bool {
    true
}

/// `[devices.cloud]`: the fields a cloud configuration POST would carry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudBootstrap {
    /// Cloud URL (`cis`).
    pub url: String,
    /// Authorization provider name (`apn`).
    pub provider: String,
    /// Cloud id (`sid`).
    pub cloud_id: String,
    /// One-time authorization code (`at`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_code: String,
}

impl CloudBootstrap {
    pub fn to_update(&self) -> ConfigurationUpdate {
        ConfigurationUpdate {
            apn: Some(self.provider.clone()),
            sid: Some(self.cloud_id.clone()),
            cis: Some(self.url.clone()),
            at: (!self.auth_code.is_empty()).then(|| self.auth_code.clone()),
        }
    }
}

// ── Validation ──────────────────────────────────────────────────────

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime.listen_addr()?;
        if self.runtime.step_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "runtime.step_timeout_secs",
                "must be positive",
            ));
        }
        if self.runtime.reconnect_interval_secs == 0 {
            return Err(ConfigError::validation(
                "runtime.reconnect_interval_secs",
                "must be positive",
            ));
        }

        let mut ids = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let field = format!("devices[{i}]");
            if device.name.trim().is_empty() {
                return Err(ConfigError::validation(
                    format!("{field}.name"),
                    "must not be empty",
                ));
            }
            if device.id.is_nil() {
                return Err(ConfigError::validation(
                    format!("{field}.id"),
                    "must not be nil",
                ));
            }
            if !ids.insert(device.id) {
                return Err(ConfigError::validation(
                    format!("{field}.id"),
                    format!("duplicate device id {}", device.id),
                ));
            }
            device.validate(&field)?;
        }
        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        let mut hrefs = HashSet::new();
        for (i, res) in self.resources.iter().enumerate() {
            let field = format!("{field}.resources[{i}].href");
            if !res.href.starts_with('/') {
                return Err(ConfigError::validation(field, "must start with '/'"));
            }
            if RESERVED_PATHS.contains(&res.href.as_str()) {
                return Err(ConfigError::validation(
                    field,
                    format!("{} is reserved", res.href),
                ));
            }
            if !hrefs.insert(res.href.as_str()) {
                return Err(ConfigError::validation(
                    field,
                    format!("duplicate resource {}", res.href),
                ));
            }
        }

        if let Some(cloud) = &self.cloud {
            if !cloud.url.is_empty() {
                url::Url::parse(&cloud.url).map_err(|e| {
                    ConfigError::validation(format!("{field}.cloud.url"), e.to_string())
                })?;
            }
        }
        Ok(())
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "cobridge", "cobridge")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn default_state_dir() -> PathBuf {
    project_dirs().map_or_else(
        || dirs_fallback(".local/state"),
        |dirs| {
            dirs.state_dir()
                .map_or_else(|| dirs.data_local_dir().join("state"), Path::to_path_buf)
        },
    )
}

fn dirs_fallback(sub: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(sub);
    p.push("cobridge");
    p
}

// ── Loading ─────────────────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then `COBRIDGE_*` variables
/// (`__` separates nesting, e.g. `COBRIDGE_RUNTIME__LISTEN`).
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(BridgeConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("COBRIDGE_").split("__"))
}

/// Load and validate the configuration. `None` uses [`config_path`].
pub fn load_config(path: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: BridgeConfig = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Render a configuration back to TOML.
pub fn to_toml(config: &BridgeConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}
