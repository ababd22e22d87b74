//! Connection orchestrator - sequences enrollment, credentials and backends
//!
//! A connect attempt runs:
//!
//! ```text
//! enrollment gate -> get_credentials -> decode -> Backend::start
//!                 -> reset connection pool -> IP refresh -> Connected
//! ```
//!
//! At most one attempt is in flight. Starting another attempt or calling
//! [`ConnectionOrchestrator::disconnect`] cancels it; the cancelled attempt
//! stops whatever engine it may have started before it releases the
//! session, and never reports `Connected`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::api::{preference_segment, BackendApi, IpInfo};
use crate::config::OrchestratorConfig;
use crate::destination::Destination;
use crate::enrollment::{EnrollmentMachine, EnrollmentStatus};
use crate::error::{ConnectError, ConnectResult};
use crate::ip_refresh::{IpRefresher, RefreshMode};
use crate::logging::LogSink;
use crate::profile::decode_profile;
use crate::storage::PreferenceStore;
use crate::vpn::{BackendKind, Backends};

/// Connection state as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting { quick: bool },
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting { quick: true } => write!(f, "connecting (quick)"),
            SessionState::Connecting { quick: false } => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// One-off notifications for the UI
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// New external address and its location
    IpChanged(IpInfo),
    EnrollmentChanged(EnrollmentStatus),
    /// A connect attempt failed; carries the logged message
    ConnectionFailed(String),
}

/// Where a connect attempt goes
#[derive(Debug, Clone, Copy)]
enum Target {
    Selected(Destination),
    Random,
}

impl Target {
    fn is_quick(&self) -> bool {
        matches!(self, Target::Random)
    }
}

/// Engines owned by the current session
#[derive(Debug, Default)]
struct Session {
    /// Engine that completed its start
    active: Option<BackendKind>,
    /// Engine whose start is under way
    pending: Option<BackendKind>,
    /// Destination the active engine serves
    destination: Option<Destination>,
}

struct Attempt {
    id: u64,
    cancel: watch::Sender<bool>,
}

/// Resolves once the attempt has been cancelled
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

pub struct ConnectionOrchestrator {
    api: Arc<dyn BackendApi>,
    store: Arc<dyn PreferenceStore>,
    backends: Backends,
    log: Arc<dyn LogSink>,
    config: OrchestratorConfig,
    enrollment: EnrollmentMachine,
    ip: Arc<IpRefresher>,
    /// Held for the whole of a connect attempt, teardown or restore
    session: Mutex<Session>,
    inflight: Mutex<Option<Attempt>>,
    next_attempt: AtomicU64,
    state: watch::Sender<SessionState>,
    /// `None` until evaluated, and again once the server rejected it
    enrollment_status: watch::Sender<Option<EnrollmentStatus>>,
    selected: watch::Sender<Option<Destination>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl ConnectionOrchestrator {
    pub fn new(
        api: Arc<dyn BackendApi>,
        store: Arc<dyn PreferenceStore>,
        backends: Backends,
        log: Arc<dyn LogSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let ip = Arc::new(IpRefresher::new(
            api.clone(),
            config.ip_refresh.clone(),
            events.clone(),
        ));
        let enrollment = EnrollmentMachine::new(api.clone(), store.clone(), config.clone())
            .with_ip_refresher(ip.clone());

        Self {
            api,
            selected: watch::Sender::new(store.selected_destination()),
            store,
            backends,
            log,
            config,
            enrollment,
            ip,
            session: Mutex::new(Session::default()),
            inflight: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
            state: watch::Sender::new(SessionState::Disconnected),
            enrollment_status: watch::Sender::new(None),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn current_ip(&self) -> Option<IpInfo> {
        self.ip.current()
    }

    /// Last enrollment outcome, `None` if unknown
    pub fn enrollment_status(&self) -> Option<EnrollmentStatus> {
        *self.enrollment_status.borrow()
    }

    /// Destination currently shown as selected
    pub fn selected_destination(&self) -> Option<Destination> {
        *self.selected.borrow()
    }

    pub fn subscribe_selected(&self) -> watch::Receiver<Option<Destination>> {
        self.selected.subscribe()
    }

    /// Recorded failures, for diagnostics
    pub fn logs(&self) -> String {
        self.log.dump()
    }

    /// True iff exactly one engine reports a live session
    pub async fn is_connected(&self) -> bool {
        self.backends.connected().await.len() == 1
    }

    /// Adopt an engine that is already running, e.g. after a restart
    pub async fn restore(&self) -> SessionState {
        let mut session = self.session.lock().await;
        let connected = self.backends.connected().await;
        debug!("Tunnel state on restore: {:?}", connected);

        let kind = match connected.as_slice() {
            [] => None,
            [kind] => Some(*kind),
            _ => {
                warn!("Both engines report connected, stopping relay");
                self.backends.get(BackendKind::Relay).stop().await;
                Some(BackendKind::Tunnel)
            }
        };

        let state = match kind {
            Some(kind) => {
                let tunnel = self.backends.get(kind).current_tunnel().await;
                session.active = Some(kind);
                session.destination = tunnel.and_then(|t| Destination::from_server_id(&t.server_id));
                info!("Restored {} session ({:?})", kind, session.destination);
                SessionState::Connected
            }
            None => {
                *session = Session::default();
                SessionState::Disconnected
            }
        };
        self.set_state(state);
        state
    }

    /// Run the enrollment state machine and publish the outcome
    ///
    /// An expired token is cleared and the evaluation repeated once.
    pub async fn enroll(&self) -> EnrollmentStatus {
        self.run_enrollment(false).await
    }

    async fn run_enrollment(&self, clear_token: bool) -> EnrollmentStatus {
        if clear_token {
            self.store.clear_token();
        }

        let mut status = self.enrollment.evaluate().await;
        if status == EnrollmentStatus::TokenExpired && !clear_token {
            info!("Token has expired, enrolling again");
            self.store.clear_token();
            status = self.enrollment.evaluate().await;
        }

        self.set_enrollment(Some(status));
        status
    }

    /// Connect to `destination`, replacing any current session
    pub async fn connect(&self, destination: Destination) -> ConnectResult<()> {
        self.run_attempt(Target::Selected(destination)).await
    }

    /// Connect to a randomly chosen destination
    pub async fn quick_connect(&self) -> ConnectResult<()> {
        self.run_attempt(Target::Random).await
    }

    /// Cancel any attempt in flight and stop the active engine
    ///
    /// Does nothing when there is no session.
    pub async fn disconnect(&self) {
        let cancelled = self.cancel_inflight().await;

        let stopped = {
            let mut session = self.session.lock().await;
            let stopped = self.teardown(&mut session).await;
            self.set_state(SessionState::Disconnected);
            stopped
        };

        if stopped || cancelled {
            info!("Disconnected");
            self.ip.refresh(RefreshMode::UntilChanged).await;
        }
    }

    /// Apply a new destination selection
    ///
    /// A live session for another (or an unknown) destination is torn down
    /// before the new selection is published. Waits for any attempt in
    /// flight first.
    pub async fn on_destination_changed(&self, destination: Option<Destination>) {
        debug!(
            "Destination changed to {:?} (prev: {:?})",
            destination,
            self.selected_destination()
        );

        // an adopted session with an unreadable server id counts as stale
        let stale = {
            let session = self.session.lock().await;
            self.state() == SessionState::Connected
                && (session.destination.is_none() || session.destination != destination)
        };
        if stale {
            self.disconnect().await;
        }

        self.selected.send_replace(destination);
    }

    /// Follow the preference store's destination selection
    pub fn spawn_destination_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut rx = self.store.subscribe_destination();

        tokio::spawn(async move {
            loop {
                let destination = *rx.borrow_and_update();
                orchestrator.on_destination_changed(destination).await;
                if rx.changed().await.is_err() {
                    debug!("Destination source closed");
                    break;
                }
            }
        })
    }

    async fn run_attempt(&self, target: Target) -> ConnectResult<()> {
        let (id, mut cancel) = self.begin_attempt().await;
        let result = self.attempt(target, &mut cancel).await;
        self.finish_attempt(id).await;
        result
    }

    async fn attempt(&self, target: Target, cancel: &mut watch::Receiver<bool>) -> ConnectResult<()> {
        let mut session = self.session.lock().await;
        if *cancel.borrow() {
            return Err(ConnectError::Cancelled);
        }
        self.set_state(SessionState::Connecting {
            quick: target.is_quick(),
        });

        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(ConnectError::Cancelled),
            result = self.establish(&mut session, target) => result,
        };

        // a cancel that raced a successful start still wins
        let outcome = match outcome {
            Ok(()) if *cancel.borrow() => Err(ConnectError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.teardown(&mut session).await;
                self.set_state(SessionState::Disconnected);
                self.report_failure(&e);
                if e.requires_enrollment() && self.enrollment_status().is_none() {
                    self.reenroll(&e, cancel).await;
                }
                Err(e)
            }
        }
    }

    /// Evaluate enrollment again after the server rejected the device
    ///
    /// Runs with the session gate held and ends as soon as the attempt is
    /// cancelled.
    async fn reenroll(&self, error: &ConnectError, cancel: &mut watch::Receiver<bool>) {
        let clear_token = *error == ConnectError::TokenExpired;
        tokio::select! {
            biased;
            _ = cancelled(cancel) => debug!("Re-enrollment cancelled"),
            status = self.run_enrollment(clear_token) => debug!("Re-enrollment finished: {}", status),
        }
    }

    async fn establish(&self, session: &mut Session, target: Target) -> ConnectResult<()> {
        if self.teardown(session).await {
            debug!("Stopped previous session before connecting");
        }

        let destination = match target {
            Target::Selected(destination) => destination,
            Target::Random => self.pick_random_destination().await?,
        };

        self.ensure_enrolled().await?;

        let protocol = self.store.protocol_preference();
        info!(
            "Requesting credentials for {} (protocol: {:?})",
            destination,
            preference_segment(protocol)
        );
        let credentials = match self
            .api
            .get_credentials(destination.country_id, destination.city_id, protocol)
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => {
                let error = ConnectError::from_credentials_error(e);
                match error {
                    ConnectError::Banned => self.set_enrollment(Some(EnrollmentStatus::Banned)),
                    ConnectError::NotEnrolled | ConnectError::TokenExpired => self.set_enrollment(None),
                    _ => {}
                }
                return Err(error);
            }
        };

        let profile = decode_profile(&credentials)?.with_dns(self.config.dns);
        let backend = self.backends.for_profile(&profile);

        let other = self.backends.get(backend.kind().other());
        if other.is_connected().await {
            warn!("{} backend still connected, stopping it", other.name());
            other.stop().await;
        }

        let server_id = destination.server_id();
        info!("Starting {} backend for {}", backend.name(), server_id);
        session.pending = Some(backend.kind());
        let started = timeout(
            self.config.backend_start_timeout(),
            self.backends.start(&profile, &server_id),
        )
        .await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ConnectError::BackendStartFailed {
                    backend: backend.name().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ConnectError::BackendStartFailed {
                    backend: backend.name().to_string(),
                    reason: format!("timed out after {:?}", self.config.backend_start_timeout()),
                })
            }
        }

        session.active = session.pending.take();
        session.destination = Some(destination);
        info!("Connected to {} via {}", destination, backend.name());

        self.api.reset_connection_pool().await;
        self.ip.refresh(RefreshMode::UntilChanged).await;
        Ok(())
    }

    /// Evaluate enrollment for this connect; the result is never reused
    async fn ensure_enrolled(&self) -> ConnectResult<()> {
        if !self.config.verify_enrollment_on_connect {
            return Ok(());
        }

        match self.run_enrollment(false).await {
            EnrollmentStatus::Enrolled => Ok(()),
            EnrollmentStatus::NotEnrolled => Err(ConnectError::NotEnrolled),
            EnrollmentStatus::Banned => Err(ConnectError::Banned),
            EnrollmentStatus::TokenExpired => Err(ConnectError::TokenExpired),
            EnrollmentStatus::VersionOutdated => Err(ConnectError::VersionOutdated),
        }
    }

    async fn pick_random_destination(&self) -> ConnectResult<Destination> {
        let protocol = self.store.protocol_preference();

        let countries = self
            .api
            .get_countries(protocol)
            .await
            .map_err(|e| ConnectError::QuickConnectionFailed(e.to_string()))?;
        let country_id = countries
            .choose(&mut rand::thread_rng())
            .map(|country| country.id)
            .ok_or_else(|| ConnectError::QuickConnectionFailed("no countries available".to_string()))?;

        let cities = self
            .api
            .get_cities(country_id, protocol)
            .await
            .map_err(|e| ConnectError::QuickConnectionFailed(e.to_string()))?;
        let city_id = cities
            .choose(&mut rand::thread_rng())
            .map(|city| city.id)
            .ok_or_else(|| ConnectError::QuickConnectionFailed("no cities available".to_string()))?;

        let destination = Destination::new(country_id, city_id);
        info!("Quick connect picked {}", destination);
        self.store.store_selected_destination(Some(destination));
        Ok(destination)
    }

    /// Stop every engine the session owns; true if there was one
    async fn teardown(&self, session: &mut Session) -> bool {
        let mut stopped = false;
        for kind in [session.pending.take(), session.active.take()].into_iter().flatten() {
            let backend = self.backends.get(kind);
            debug!("Stopping {} backend", backend.name());
            backend.stop().await;
            stopped = true;
        }
        session.destination = None;
        stopped
    }

    async fn begin_attempt(&self) -> (u64, watch::Receiver<bool>) {
        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (cancel, rx) = watch::channel(false);

        let mut inflight = self.inflight.lock().await;
        if let Some(previous) = inflight.replace(Attempt { id, cancel }) {
            debug!("Cancelling connect attempt {}", previous.id);
            previous.cancel.send_replace(true);
        }
        (id, rx)
    }

    async fn finish_attempt(&self, id: u64) {
        let mut inflight = self.inflight.lock().await;
        if inflight.as_ref().is_some_and(|attempt| attempt.id == id) {
            inflight.take();
        }
    }

    async fn cancel_inflight(&self) -> bool {
        match self.inflight.lock().await.take() {
            Some(attempt) => {
                debug!("Cancelling connect attempt {}", attempt.id);
                attempt.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn report_failure(&self, error: &ConnectError) {
        if *error == ConnectError::Cancelled {
            debug!("Connect attempt cancelled");
            return;
        }

        let message = error.to_string();
        error!("Connection failed! reason: {}", message);
        self.log.write(&message);
        let _ = self.events.send(OrchestratorEvent::ConnectionFailed(message));
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Session state: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    fn set_enrollment(&self, status: Option<EnrollmentStatus>) {
        self.enrollment_status.send_replace(status);
        if let Some(status) = status {
            let _ = self.events.send(OrchestratorEvent::EnrollmentChanged(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connecting { quick: true }.to_string(), "connecting (quick)");
        assert_eq!(SessionState::Connected.to_string(), "connected");
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        cancelled(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited = timeout(std::time::Duration::from_secs(1), cancelled(&mut rx)).await;
        assert!(waited.is_err());
    }
}
