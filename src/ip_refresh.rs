//! External address refresh after tunnel state changes
//!
//! Pooled HTTP connections survive a tunnel coming up or going down, so
//! every query first drops the pool and gives routing a moment to settle.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::{BackendApi, IpInfo};
use crate::config::IpRefreshSettings;
use crate::orchestrator::OrchestratorEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// One query, published whatever it returns
    Single,
    /// Query until the address differs from the current one
    UntilChanged,
}

/// Tracks and republishes the device's external address
pub struct IpRefresher {
    api: Arc<dyn BackendApi>,
    settings: IpRefreshSettings,
    current: watch::Sender<Option<IpInfo>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl IpRefresher {
    pub fn new(
        api: Arc<dyn BackendApi>,
        settings: IpRefreshSettings,
        events: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            api,
            settings,
            current: watch::Sender::new(None),
            events,
        }
    }

    /// Last published address
    pub fn current(&self) -> Option<IpInfo> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<IpInfo>> {
        self.current.subscribe()
    }

    /// Query the external address and publish it when it is new
    ///
    /// Returns the published address, or `None` when the address did not
    /// change within the attempt budget or the query failed. Neither case is
    /// an error; the previous address stays current.
    pub async fn refresh(&self, mode: RefreshMode) -> Option<IpInfo> {
        let previous = self.current().map(|info| info.ip);
        let max_attempts = match mode {
            RefreshMode::Single => 1,
            RefreshMode::UntilChanged => self.settings.max_attempts.max(1),
        };
        debug!("Refreshing IP (current: {:?}, mode: {:?})", previous, mode);

        for attempt in 1..=max_attempts {
            self.api.reset_connection_pool().await;
            sleep(self.settings.settle_delay()).await;

            let info = match self.api.get_ip().await {
                Ok(info) => info,
                Err(e) => {
                    warn!("IP query failed: {}", e);
                    return None;
                }
            };
            debug!("Refresh IP attempt {}: {}", attempt, info.ip);

            let changed = previous.as_deref() != Some(info.ip.as_str());
            if changed || mode == RefreshMode::Single {
                self.publish(info.clone());
                return Some(info);
            }

            if attempt < max_attempts {
                sleep(self.settings.retry_interval()).await;
            }
        }

        debug!("IP unchanged after {} attempts", max_attempts);
        None
    }

    fn publish(&self, info: IpInfo) {
        info!("External IP: {}", info.ip);
        self.current.send_replace(Some(info.clone()));
        // no subscribers is fine
        let _ = self.events.send(OrchestratorEvent::IpChanged(info));
    }
}
