//! Enrollment state machine
//!
//! Decides whether this device may request credentials at all:
//!
//! 1. an outdated client stops here with `VersionOutdated`;
//! 2. without a device token one is registered, failing that `NotEnrolled`;
//! 3. otherwise the session endpoint is polled until it reports a terminal
//!    state or the attempt budget runs out.
//!
//! `TokenExpired` is returned as-is. Clearing the token and evaluating again
//! is the caller's job, so a server that keeps expiring tokens cannot make
//! this loop forever.

use std::fmt;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::BackendApi;
use crate::config::OrchestratorConfig;
use crate::error::StatusClass;
use crate::ip_refresh::{IpRefresher, RefreshMode};
use crate::storage::PreferenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrollmentStatus {
    Enrolled,
    NotEnrolled,
    Banned,
    TokenExpired,
    VersionOutdated,
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::NotEnrolled => "not enrolled",
            EnrollmentStatus::Banned => "banned",
            EnrollmentStatus::TokenExpired => "token expired",
            EnrollmentStatus::VersionOutdated => "version outdated",
        };
        f.write_str(s)
    }
}

/// Outcome of a single session poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Terminal(EnrollmentStatus),
    Pending,
}

pub struct EnrollmentMachine {
    api: Arc<dyn BackendApi>,
    store: Arc<dyn PreferenceStore>,
    config: OrchestratorConfig,
    ip: Option<Arc<IpRefresher>>,
}

impl EnrollmentMachine {
    pub fn new(
        api: Arc<dyn BackendApi>,
        store: Arc<dyn PreferenceStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            api,
            store,
            config,
            ip: None,
        }
    }

    /// Read the external address once before polling, after the token is known
    pub fn with_ip_refresher(mut self, ip: Arc<IpRefresher>) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Run the full evaluation
    pub async fn evaluate(&self) -> EnrollmentStatus {
        if self.is_update_required().await {
            info!("Client version is outdated");
            return EnrollmentStatus::VersionOutdated;
        }

        if !self.ensure_token().await {
            return EnrollmentStatus::NotEnrolled;
        }

        if let Some(ip) = &self.ip {
            ip.refresh(RefreshMode::Single).await;
        }

        let status = self.wait_for_enrollment().await;
        info!("Enrollment status: {}", status);
        status
    }

    /// True when the backend advertises a newer app or API version
    ///
    /// A failed version query does not block the client.
    pub async fn is_update_required(&self) -> bool {
        match self.api.get_version().await {
            Ok(versions) => {
                versions.app_version > self.config.app_version
                    || versions.api_version > self.config.api_version
            }
            Err(e) => {
                warn!("Version check failed: {}", e);
                false
            }
        }
    }

    /// Make sure a device token is stored, registering if necessary
    async fn ensure_token(&self) -> bool {
        if self.store.token().is_some() {
            return true;
        }

        match self.api.register_device().await {
            Ok(device) if !device.token.is_empty() => {
                debug!("Token has been updated");
                self.store.store_token(&device.token);
                true
            }
            Ok(_) => {
                warn!("Device registration returned an empty token");
                false
            }
            Err(e) => {
                warn!("Device registration failed: {}", e);
                false
            }
        }
    }

    /// Poll the session endpoint until a terminal answer or the budget runs out
    pub async fn wait_for_enrollment(&self) -> EnrollmentStatus {
        let max_attempts = self.config.enrollment.max_attempts;

        for attempt in 0..max_attempts {
            if let Poll::Terminal(status) = self.poll_once().await {
                return status;
            }

            debug!("Enrollment pending ({}/{})", attempt + 1, max_attempts);
            if attempt + 1 < max_attempts {
                sleep(self.config.enrollment.poll_interval()).await;
            }
        }

        EnrollmentStatus::NotEnrolled
    }

    async fn poll_once(&self) -> Poll {
        match self.api.get_session().await {
            Ok(session) if session.is_banned => Poll::Terminal(EnrollmentStatus::Banned),
            Ok(session) if session.is_enrolled => Poll::Terminal(EnrollmentStatus::Enrolled),
            Ok(_) => Poll::Pending,
            Err(e) => match e.status {
                StatusClass::Unauthorized => Poll::Terminal(EnrollmentStatus::TokenExpired),
                StatusClass::Forbidden => Poll::Terminal(EnrollmentStatus::Banned),
                _ => {
                    debug!("Session poll failed: {}", e);
                    Poll::Pending
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DeviceToken, MockBackendApi, SessionInfo, VersionInfo};
    use crate::error::ApiError;
    use crate::storage::MemoryPreferenceStore;
    use mockall::Sequence;
    use std::time::Duration;

    const PENDING: SessionInfo = SessionInfo {
        is_banned: false,
        is_enrolled: false,
    };

    fn current_version(api: &mut MockBackendApi) {
        api.expect_get_version().returning(|| {
            Ok(VersionInfo {
                app_version: 10,
                api_version: 2,
            })
        });
    }

    fn machine(api: MockBackendApi, store: Arc<MemoryPreferenceStore>) -> EnrollmentMachine {
        EnrollmentMachine::new(Arc::new(api), store, OrchestratorConfig::with_versions(10, 2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_on_last_attempt() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        let mut seq = Sequence::new();
        api.expect_get_session()
            .times(19)
            .in_sequence(&mut seq)
            .returning(|| Ok(PENDING));
        api.expect_get_session()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(SessionInfo {
                    is_banned: true,
                    is_enrolled: false,
                })
            });

        let store = Arc::new(MemoryPreferenceStore::with_token("token"));
        let started = tokio::time::Instant::now();
        assert_eq!(machine(api, store).evaluate().await, EnrollmentStatus::Banned);
        assert_eq!(started.elapsed(), Duration::from_secs(19 * 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_pending_is_not_enrolled() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        api.expect_get_session().times(20).returning(|| Ok(PENDING));

        let store = Arc::new(MemoryPreferenceStore::with_token("token"));
        assert_eq!(machine(api, store).evaluate().await, EnrollmentStatus::NotEnrolled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrolled_stops_polling() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        let mut seq = Sequence::new();
        api.expect_get_session()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|| Err(ApiError::http(425, "")));
        api.expect_get_session()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Ok(SessionInfo {
                    is_banned: false,
                    is_enrolled: true,
                })
            });

        let store = Arc::new(MemoryPreferenceStore::with_token("token"));
        assert_eq!(machine(api, store).evaluate().await, EnrollmentStatus::Enrolled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_token_expired() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        api.expect_get_session()
            .times(1)
            .returning(|| Err(ApiError::http(401, "unauthorized")));

        let store = Arc::new(MemoryPreferenceStore::with_token("stale"));
        let status = machine(api, store.clone()).evaluate().await;
        assert_eq!(status, EnrollmentStatus::TokenExpired);
        // clearing is left to the caller
        assert_eq!(store.token().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_outdated_version_short_circuits() {
        let mut api = MockBackendApi::new();
        api.expect_get_version().times(1).returning(|| {
            Ok(VersionInfo {
                app_version: 11,
                api_version: 2,
            })
        });

        let store = Arc::new(MemoryPreferenceStore::new());
        assert_eq!(
            machine(api, store).evaluate().await,
            EnrollmentStatus::VersionOutdated
        );
    }

    #[tokio::test]
    async fn test_failed_version_check_does_not_block() {
        let mut api = MockBackendApi::new();
        api.expect_get_version()
            .returning(|| Err(ApiError::transport("offline")));
        let store = Arc::new(MemoryPreferenceStore::new());
        assert!(!machine(api, store).is_update_required().await);
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_enrolled() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        api.expect_register_device()
            .times(1)
            .returning(|| Err(ApiError::http(500, "")));

        let store = Arc::new(MemoryPreferenceStore::new());
        assert_eq!(machine(api, store).evaluate().await, EnrollmentStatus::NotEnrolled);
    }

    #[tokio::test]
    async fn test_registration_stores_token() {
        let mut api = MockBackendApi::new();
        current_version(&mut api);
        api.expect_register_device().times(1).returning(|| {
            Ok(DeviceToken {
                token: "fresh".to_string(),
            })
        });
        api.expect_get_session().times(1).returning(|| {
            Ok(SessionInfo {
                is_banned: false,
                is_enrolled: true,
            })
        });

        let store = Arc::new(MemoryPreferenceStore::new());
        let status = machine(api, store.clone()).evaluate().await;
        assert_eq!(status, EnrollmentStatus::Enrolled);
        assert_eq!(store.token().as_deref(), Some("fresh"));
    }
}
