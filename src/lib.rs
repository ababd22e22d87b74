//! basedvpn - Connection orchestration core
//!
//! Async library behind a dual-protocol VPN client:
//! - Credential payload decoding (WireGuard-style tunnel, VMess-style relay)
//! - Enrollment gating against the backend's session endpoint
//! - Connect / disconnect sequencing across the two tunnel engines
//! - External IP refresh after tunnel state changes
//!
//! The tunnel engines, the HTTP transport and preference persistence are
//! supplied by the embedding application through the traits in [`vpn`],
//! [`api`] and [`storage`].

pub mod error;
pub mod config;
pub mod logging;
pub mod destination;
pub mod profile;
pub mod api;
pub mod storage;
pub mod vpn;
pub mod enrollment;
pub mod ip_refresh;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ConnectError, ConnectResult, DecodeError, StatusClass};
pub use config::OrchestratorConfig;
pub use logging::{init_logging, LogEntry, LogSink, MemoryLogSink};
pub use destination::Destination;
pub use profile::{
    decode_profile, decode_relay, decode_tunnel, ConnectionProfile, DnsPreset, RelayProfile,
    Transport, TunnelProfile,
};
pub use api::{
    BackendApi, City, Country, Credentials, DeviceToken, IpInfo, Protocol, ProtocolPreference,
    SessionInfo, VersionInfo,
};
pub use storage::{MemoryPreferenceStore, PreferenceStore};
pub use vpn::{Backend, BackendError, BackendKind, Backends, SessionBackend, TunnelInfo};
pub use enrollment::{EnrollmentMachine, EnrollmentStatus};
pub use ip_refresh::{IpRefresher, RefreshMode};
pub use orchestrator::{ConnectionOrchestrator, OrchestratorEvent, SessionState};
