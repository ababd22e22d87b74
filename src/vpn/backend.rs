use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::profile::{ConnectionProfile, RelayProfile, TunnelProfile};

/// Engine refused or failed to bring the session up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// What an engine reports about its running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub server_id: String,
}

/// Common interface both tunnel engines implement
#[async_trait]
pub trait SessionBackend<P>: Send + Sync
where
    P: Send + Sync,
{
    /// Name of this engine (e.g. "wireguard", "v2ray")
    fn name(&self) -> &str;

    /// Bring the session up for `server_id`
    async fn start(&self, profile: &P, server_id: &str) -> Result<(), BackendError>;

    /// Tear the session down; a no-op when nothing is running
    async fn stop(&self);

    async fn is_connected(&self) -> bool;

    /// Details of the running session, if any
    async fn current_tunnel(&self) -> Option<TunnelInfo>;
}

pub type TunnelBackend = dyn SessionBackend<TunnelProfile>;
pub type RelayBackend = dyn SessionBackend<RelayProfile>;

/// Which engine a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Tunnel,
    Relay,
}

impl BackendKind {
    pub fn other(&self) -> Self {
        match self {
            BackendKind::Tunnel => BackendKind::Relay,
            BackendKind::Relay => BackendKind::Tunnel,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Tunnel => write!(f, "tunnel"),
            BackendKind::Relay => write!(f, "relay"),
        }
    }
}

/// One of the two engines
#[derive(Clone)]
pub enum Backend {
    Tunnel(Arc<TunnelBackend>),
    Relay(Arc<RelayBackend>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Tunnel(_) => BackendKind::Tunnel,
            Backend::Relay(_) => BackendKind::Relay,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::Tunnel(b) => b.name(),
            Backend::Relay(b) => b.name(),
        }
    }

    pub async fn stop(&self) {
        match self {
            Backend::Tunnel(b) => b.stop().await,
            Backend::Relay(b) => b.stop().await,
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self {
            Backend::Tunnel(b) => b.is_connected().await,
            Backend::Relay(b) => b.is_connected().await,
        }
    }

    pub async fn current_tunnel(&self) -> Option<TunnelInfo> {
        match self {
            Backend::Tunnel(b) => b.current_tunnel().await,
            Backend::Relay(b) => b.current_tunnel().await,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend::{:?}({})", self.kind(), self.name())
    }
}

/// The pair of engines available to the orchestrator
#[derive(Clone)]
pub struct Backends {
    tunnel: Arc<TunnelBackend>,
    relay: Arc<RelayBackend>,
}

impl Backends {
    pub fn new(tunnel: Arc<TunnelBackend>, relay: Arc<RelayBackend>) -> Self {
        Self { tunnel, relay }
    }

    pub fn get(&self, kind: BackendKind) -> Backend {
        match kind {
            BackendKind::Tunnel => Backend::Tunnel(self.tunnel.clone()),
            BackendKind::Relay => Backend::Relay(self.relay.clone()),
        }
    }

    /// Engine that runs the given profile
    pub fn for_profile(&self, profile: &ConnectionProfile) -> Backend {
        match profile {
            ConnectionProfile::Tunnel(_) => self.get(BackendKind::Tunnel),
            ConnectionProfile::Relay(_) => self.get(BackendKind::Relay),
        }
    }

    /// Start the engine matching `profile`
    pub async fn start(&self, profile: &ConnectionProfile, server_id: &str) -> Result<(), BackendError> {
        match profile {
            ConnectionProfile::Tunnel(p) => self.tunnel.start(p, server_id).await,
            ConnectionProfile::Relay(p) => self.relay.start(p, server_id).await,
        }
    }

    /// Engines currently reporting a live session
    pub async fn connected(&self) -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        for kind in [BackendKind::Tunnel, BackendKind::Relay] {
            if self.get(kind).is_connected().await {
                kinds.push(kind);
            }
        }
        kinds
    }
}
