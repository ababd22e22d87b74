//! Local preferences consumed by the orchestrator
//!
//! Persistence is the embedding application's business; the orchestrator
//! only needs the device token, the protocol preference and the selected
//! destination, the latter as a subscription.

use tokio::sync::watch;
use tracing::debug;

use crate::api::ProtocolPreference;
use crate::destination::Destination;

/// Preference store used by the orchestrator
pub trait PreferenceStore: Send + Sync {
    /// Stored device token, if any
    fn token(&self) -> Option<String>;

    fn store_token(&self, token: &str);

    fn clear_token(&self);

    fn protocol_preference(&self) -> ProtocolPreference;

    fn selected_destination(&self) -> Option<Destination>;

    fn store_selected_destination(&self, destination: Option<Destination>);

    /// Stream of destination selections, starting from the current one
    fn subscribe_destination(&self) -> watch::Receiver<Option<Destination>>;
}

/// In-memory preference store
pub struct MemoryPreferenceStore {
    token: watch::Sender<Option<String>>,
    protocol: watch::Sender<ProtocolPreference>,
    destination: watch::Sender<Option<Destination>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self {
            token: watch::Sender::new(None),
            protocol: watch::Sender::new(None),
            destination: watch::Sender::new(None),
        }
    }

    pub fn with_token(token: &str) -> Self {
        let store = Self::new();
        store.store_token(token);
        store
    }

    pub fn set_protocol_preference(&self, protocol: ProtocolPreference) {
        self.protocol.send_replace(protocol);
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn token(&self) -> Option<String> {
        self.token.borrow().clone().filter(|t| !t.is_empty())
    }

    fn store_token(&self, token: &str) {
        debug!("Device token updated");
        self.token.send_replace(Some(token.to_string()));
    }

    fn clear_token(&self) {
        debug!("Device token cleared");
        self.token.send_replace(None);
    }

    fn protocol_preference(&self) -> ProtocolPreference {
        *self.protocol.borrow()
    }

    fn selected_destination(&self) -> Option<Destination> {
        *self.destination.borrow()
    }

    fn store_selected_destination(&self, destination: Option<Destination>) {
        self.destination.send_replace(destination);
    }

    fn subscribe_destination(&self) -> watch::Receiver<Option<Destination>> {
        self.destination.subscribe()
    }
}
