// ── Cloud configuration model ──
//
// The state behind the cloud configuration resource: what the device is
// told to register with, and how far registration has progressed. The
// manager owns one `CloudConfiguration` behind a mutex and hands out
// copies.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::credentials::CredentialsRecord;
use crate::error::{CoreError, clec};

pub const CONFIGURATION_PATH: &str = "/CoapCloudConfResURI";
pub const CONFIGURATION_RESOURCE_TYPE: &str = "oic.r.coapcloudconf";
pub const BASELINE_INTERFACE: &str = "oic.if.baseline";
const CONFIGURATION_NAME: &str = "Cloud Configuration";

// ── ProvisioningStatus ───────────────────────────────────────────────

/// Registration phase, ordered by protocol progress.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProvisioningStatus {
    #[default]
    Uninitialized,
    ReadyToRegister,
    Registering,
    Registered,
    Deregistering,
}

// ── CloudConfiguration ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfiguration {
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
    pub name: String,
    pub authorization_provider: String,
    pub cloud_id: String,
    pub url: String,
    pub last_error_code: i64,
    pub provisioning_status: ProvisioningStatus,
    /// One-shot code consumed by sign-up.
    pub authorization_code: String,
}

impl Default for CloudConfiguration {
    fn default() -> Self {
        Self {
            resource_types: vec![CONFIGURATION_RESOURCE_TYPE.to_owned()],
            interfaces: vec![BASELINE_INTERFACE.to_owned()],
            name: CONFIGURATION_NAME.to_owned(),
            authorization_provider: String::new(),
            cloud_id: String::new(),
            url: String::new(),
            last_error_code: clec::NONE,
            provisioning_status: ProvisioningStatus::Uninitialized,
            authorization_code: String::new(),
        }
    }
}

impl CloudConfiguration {
    /// Whether a cloud endpoint is configured.
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }

    /// Apply a configuration update.
    ///
    /// An empty URL in the merged result clears the configuration and
    /// forces `Uninitialized`. Otherwise `cloud_id`, `authorization_provider`
    /// and `url` must all be non-empty; on failure `self` is untouched.
    pub fn apply(&mut self, update: ConfigurationUpdate) -> Result<(), CoreError> {
        let url = update.cis.unwrap_or_else(|| self.url.clone());
        if url.is_empty() {
            self.clear();
            return Ok(());
        }

        let provider = update
            .apn
            .unwrap_or_else(|| self.authorization_provider.clone());
        let cloud_id = update.sid.unwrap_or_else(|| self.cloud_id.clone());

        if cloud_id.is_empty() {
            return Err(CoreError::validation("cloud id (sid) must not be empty"));
        }
        if provider.is_empty() {
            return Err(CoreError::validation(
                "authorization provider (apn) must not be empty",
            ));
        }

        self.url = url;
        self.authorization_provider = provider;
        self.cloud_id = cloud_id;
        if let Some(code) = update.at {
            self.authorization_code = code;
        }
        self.last_error_code = clec::NONE;
        self.provisioning_status = ProvisioningStatus::ReadyToRegister;
        Ok(())
    }

    /// Drop everything that points at a cloud.
    pub fn clear(&mut self) {
        self.url.clear();
        self.cloud_id.clear();
        self.authorization_provider.clear();
        self.authorization_code.clear();
        self.last_error_code = clec::NONE;
        self.provisioning_status = ProvisioningStatus::Uninitialized;
    }

    /// Re-derive the status from the URL after a credential reset.
    pub fn reset_status(&mut self) {
        self.provisioning_status = if self.is_enabled() {
            ProvisioningStatus::ReadyToRegister
        } else {
            ProvisioningStatus::Uninitialized
        };
    }

    pub fn representation(&self) -> ConfigurationRepresentation {
        ConfigurationRepresentation {
            rt: self.resource_types.clone(),
            interfaces: self.interfaces.clone(),
            n: self.name.clone(),
            apn: self.authorization_provider.clone(),
            sid: self.cloud_id.clone(),
            cis: self.url.clone(),
            clec: self.last_error_code,
            cps: self.provisioning_status,
        }
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────

/// Body of a GET on the configuration resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationRepresentation {
    pub rt: Vec<String>,
    #[serde(rename = "if")]
    pub interfaces: Vec<String>,
    pub n: String,
    pub apn: String,
    pub sid: String,
    pub cis: String,
    pub clec: i64,
    pub cps: ProvisioningStatus,
}

/// Body of a POST on the configuration resource. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationUpdate {
    pub apn: Option<String>,
    pub sid: Option<String>,
    pub cis: Option<String>,
    pub at: Option<String>,
}

// ── Manager tuning ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudManagerConfig {
    /// Period of the reconnection timer. Default: 10s.
    pub reconnect_interval: Duration,
    /// Upper bound on each `connect` step and on sign-off. Default: 10s.
    pub step_timeout: Duration,
    /// Refresh the access token this long before it expires. Default: 5min.
    pub refresh_margin: Duration,
}

impl Default for CloudManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(10),
            step_timeout: Duration::from_secs(10),
            refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────

/// What the manager hands to its save callback and accepts at start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub configuration: CloudConfiguration,
    pub credentials: CredentialsRecord,
}
