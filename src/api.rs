//! Backend API client interface and wire models
//!
//! The HTTP transport itself lives outside this crate. Implementations of
//! [`BackendApi`] are expected to attach the app/device token headers and
//! to report failures as [`ApiError`] with the response status classified,
//! so the orchestrator never has to inspect raw transport errors.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ApiError, ApiResult};

/// Tunnel protocol declared by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// WireGuard-style point-to-point tunnel
    #[serde(rename = "WIREGUARD")]
    Tunnel,
    /// VMess-style relay
    #[serde(rename = "V2RAY")]
    Relay,
}

impl Protocol {
    /// Segment used in the credentials URL
    pub fn path_segment(&self) -> &'static str {
        match self {
            Protocol::Tunnel => "wireguard",
            Protocol::Relay => "v2ray",
        }
    }

    /// Parse a stored preference; anything unrecognised means "any"
    pub fn from_preference(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "WIREGUARD" => Some(Protocol::Tunnel),
            "V2RAY" => Some(Protocol::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Protocol the client asks for; `None` lets the server choose
pub type ProtocolPreference = Option<Protocol>;

/// Path segment for a preference, empty for "any"
pub fn preference_segment(preference: ProtocolPreference) -> &'static str {
    preference.map(|p| p.path_segment()).unwrap_or("")
}

/// `{"data": ...}` wrapper used by every endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Parse an enveloped JSON response body
pub fn decode_envelope<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(ApiError::from)?;
    Ok(envelope.data)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceToken {
    pub token: String,
}

/// Enrollment state of this device as seen by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub is_banned: bool,
    #[serde(default)]
    pub is_enrolled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Country {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub servers_available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct City {
    pub id: u32,
    pub country_id: u32,
    pub name: String,
    #[serde(default)]
    pub servers_available: u32,
}

/// Single-use credentials for one connect attempt
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub protocol: Protocol,
    /// Base64 payload
    pub payload: String,
    /// Private key (tunnel) or user id (relay)
    #[serde(rename = "private_key", alias = "uid")]
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("protocol", &self.protocol)
            .field("payload", &self.payload)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// External address as seen by the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IpInfo {
    pub ip: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Minimum versions the backend accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VersionInfo {
    pub app_version: u64,
    pub api_version: u64,
}

/// Backend API consumed by the orchestrator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Register this device and obtain a device token
    async fn register_device(&self) -> ApiResult<DeviceToken>;

    /// Current enrollment state of the device token
    async fn get_session(&self) -> ApiResult<SessionInfo>;

    async fn get_countries(&self, protocol: ProtocolPreference) -> ApiResult<Vec<Country>>;

    async fn get_cities(&self, country_id: u32, protocol: ProtocolPreference) -> ApiResult<Vec<City>>;

    /// Request credentials for one connect attempt
    async fn get_credentials(
        &self,
        country_id: u32,
        city_id: u32,
        protocol: ProtocolPreference,
    ) -> ApiResult<Credentials>;

    async fn get_ip(&self) -> ApiResult<IpInfo>;

    async fn get_version(&self) -> ApiResult<VersionInfo>;

    /// Drop pooled connections so the next request takes the current route
    async fn reset_connection_pool(&self);
}
