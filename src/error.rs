//! Error types for basedvpn
//!
//! Everything that can go wrong while connecting is folded into
//! [`ConnectError`] before it leaves the orchestrator. Raw API failures are
//! carried as [`ApiError`], whose [`StatusClass`] is what the orchestrator
//! matches on.

use std::fmt;
use std::io;
use thiserror::Error;

/// Classification of a failed backend API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 401 - token missing or no longer valid
    Unauthorized,
    /// 403 - device has been banned
    Forbidden,
    /// 425 - device is still being enrolled
    TooEarly,
    /// Any other status code, or `None` for transport-level failures
    Other(Option<u16>),
}

impl StatusClass {
    /// Classify a raw HTTP status code
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => StatusClass::Unauthorized,
            403 => StatusClass::Forbidden,
            425 => StatusClass::TooEarly,
            other => StatusClass::Other(Some(other)),
        }
    }

    /// The numeric status code, if the failure had one
    pub fn code(&self) -> Option<u16> {
        match self {
            StatusClass::Unauthorized => Some(401),
            StatusClass::Forbidden => Some(403),
            StatusClass::TooEarly => Some(425),
            StatusClass::Other(code) => *code,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "HTTP {}", code),
            None => write!(f, "transport"),
        }
    }
}

/// Failure of a backend API call
#[derive(Debug, Clone, Error)]
#[error("{status} error: {detail}")]
pub struct ApiError {
    pub status: StatusClass,
    pub detail: String,
}

impl ApiError {
    /// Error carrying an HTTP status code and (possibly empty) response body
    pub fn http(code: u16, detail: impl Into<String>) -> Self {
        Self {
            status: StatusClass::from_code(code),
            detail: detail.into(),
        }
    }

    /// Error raised before any response was received
    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            status: StatusClass::Other(None),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::transport(format!("invalid response body: {}", error))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure to turn a credential payload into a connection profile
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("payload has wrong length: expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Closed set of failures surfaced by the connection orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("User not enrolled")]
    NotEnrolled,

    #[error("User has been banned")]
    Banned,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Application version is outdated")]
    VersionOutdated,

    #[error("Cannot build connection profile: {0}")]
    MalformedPayload(#[from] DecodeError),

    #[error("Failed to start {backend} backend: {reason}")]
    BackendStartFailed { backend: String, reason: String },

    #[error("Get credentials error: {0}")]
    CredentialFetchFailed(String),

    #[error("Quick connection failed: {0}")]
    QuickConnectionFailed(String),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Map a failed credential request onto the taxonomy
    pub fn from_credentials_error(error: ApiError) -> Self {
        match error.status {
            StatusClass::Unauthorized => ConnectError::TokenExpired,
            StatusClass::Forbidden => ConnectError::Banned,
            StatusClass::TooEarly => ConnectError::NotEnrolled,
            StatusClass::Other(_) => ConnectError::CredentialFetchFailed(error.to_string()),
        }
    }

    /// Errors that are resolved by re-running enrollment instead of being
    /// shown to the user
    pub fn requires_enrollment(&self) -> bool {
        matches!(self, ConnectError::NotEnrolled | ConnectError::TokenExpired)
    }
}

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type ConnectResult<T> = Result<T, ConnectError>;
