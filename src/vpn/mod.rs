//! Tunnel engine abstraction
//!
//! The orchestrator drives two engines that it treats as black boxes:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Connection Orchestrator        │
//! └──────────────┬──────────────────────┘
//!                │  Backend (tagged, one active at a time)
//!        ┌───────┴────────┐
//!        ▼                ▼
//!   ┌─────────┐      ┌─────────┐
//!   │ Tunnel  │      │  Relay  │   <- SessionBackend implementations
//!   └─────────┘      └─────────┘
//! ```
//!
//! Each engine implements [`SessionBackend`] for its own profile type. The
//! engine to use is picked once per connect from the protocol the server
//! declared, and the orchestrator remembers which one it started.

pub mod backend;

pub use backend::{
    Backend, BackendError, BackendKind, Backends, RelayBackend, SessionBackend, TunnelBackend,
    TunnelInfo,
};
