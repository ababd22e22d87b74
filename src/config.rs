//! Configuration management for basedvpn

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::profile::DnsPreset;

/// Main orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Local application version, compared against the advertised minimum
    #[serde(default)]
    pub app_version: u64,
    /// Local API version, compared against the advertised minimum
    #[serde(default)]
    pub api_version: u64,
    /// Enrollment polling settings
    #[serde(default)]
    pub enrollment: EnrollmentSettings,
    /// External IP refresh settings
    #[serde(default)]
    pub ip_refresh: IpRefreshSettings,
    /// How long a backend may take to come up (milliseconds)
    #[serde(default = "default_backend_start_timeout")]
    pub backend_start_timeout_ms: u64,
    /// Run the enrollment check before requesting credentials
    #[serde(default = "default_verify_enrollment")]
    pub verify_enrollment_on_connect: bool,
    /// DNS servers applied to every decoded profile before start
    #[serde(default)]
    pub dns: DnsPreset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentSettings {
    /// Session polls before giving up
    #[serde(default = "default_enrollment_attempts")]
    pub max_attempts: u32,
    /// Delay between session polls (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRefreshSettings {
    /// Queries after a state change before keeping the old address
    #[serde(default = "default_refresh_attempts")]
    pub max_attempts: u32,
    /// Delay after dropping pooled connections (milliseconds)
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Delay between queries (milliseconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_backend_start_timeout() -> u64 {
    5_000
}

fn default_verify_enrollment() -> bool {
    true
}

fn default_enrollment_attempts() -> u32 {
    20
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_refresh_attempts() -> u32 {
    3
}

fn default_settle_delay() -> u64 {
    300
}

fn default_retry_interval() -> u64 {
    1_000
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_enrollment_attempts(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for IpRefreshSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_refresh_attempts(),
            settle_delay_ms: default_settle_delay(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            app_version: 0,
            api_version: 0,
            enrollment: EnrollmentSettings::default(),
            ip_refresh: IpRefreshSettings::default(),
            backend_start_timeout_ms: default_backend_start_timeout(),
            verify_enrollment_on_connect: default_verify_enrollment(),
            dns: DnsPreset::default(),
        }
    }
}

impl EnrollmentSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl IpRefreshSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl OrchestratorConfig {
    /// Configuration for a client at the given versions, defaults elsewhere
    pub fn with_versions(app_version: u64, api_version: u64) -> Self {
        Self {
            app_version,
            api_version,
            ..Self::default()
        }
    }

    pub fn backend_start_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_start_timeout_ms)
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
