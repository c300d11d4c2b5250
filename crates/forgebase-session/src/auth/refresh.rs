//! Single-flight token renewal.
//!
//! Every caller that needs a fresh session while a renewal is running joins
//! that renewal instead of starting its own, so N concurrent 401s produce one
//! call to the refresh endpoint and one new token pair.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::envelope::{decode_auth, RefreshTokenRequest};
use crate::api::{ApiError, ApiRequest, Transport, REFRESH_PATH};

use super::session::{Credentials, Generation, Session, SessionStore};

/// Why a renewal did not produce a session. Shared by every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Token refresh failed: {0}")]
    Transport(String),

    #[error("Malformed refresh response: {0}")]
    Malformed(String),

    /// The session was replaced or cleared while the renewal was running
    #[error("Session changed during token refresh")]
    Superseded,
}

pub type RenewOutcome = Result<Session, RenewError>;

type SharedRenewal = Shared<BoxFuture<'static, RenewOutcome>>;

struct InFlight {
    generation: Generation,
    renewal: SharedRenewal,
}

pub struct RefreshCoordinator {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    in_flight: Mutex<Option<InFlight>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            in_flight: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Produce a fresh session.
    ///
    /// `stale_access_token` is the token the failed request carried. If the
    /// store already holds a different one, that session is returned without
    /// contacting the backend.
    pub async fn renew(&self, stale_access_token: Option<&str>) -> RenewOutcome {
        let renewal = {
            let mut slot = self.slot();

            let running = slot
                .as_ref()
                .filter(|in_flight| in_flight.renewal.peek().is_none());

            match running {
                Some(in_flight) => {
                    debug!(generation = ?in_flight.generation, "Joining in-flight token refresh");
                    in_flight.renewal.clone()
                }
                None => {
                    let current = self.store.get();
                    if current.is_authenticated() && current.access_token() != stale_access_token {
                        debug!("Session already renewed, skipping refresh");
                        return Ok(current);
                    }

                    let generation = self.store.generation();
                    let renewal = Self::run(self.store.clone(), self.transport.clone(), generation)
                        .boxed()
                        .shared();
                    *slot = Some(InFlight {
                        generation,
                        renewal: renewal.clone(),
                    });
                    renewal
                }
            }
        };

        renewal.await
    }

    /// Forget any in-flight renewal. Its result will not be written to the
    /// store once the session generation has moved on.
    pub fn reset(&self) {
        if self.slot().take().is_some() {
            debug!("Discarded in-flight token refresh");
        }
    }

    /// Whether a renewal is currently running
    pub fn is_renewing(&self) -> bool {
        self.slot()
            .as_ref()
            .map(|in_flight| in_flight.renewal.peek().is_none())
            .unwrap_or(false)
    }

    async fn run(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        generation: Generation,
    ) -> RenewOutcome {
        let outcome = Self::exchange(&store, transport.as_ref()).await;

        match outcome {
            Ok(credentials) => {
                if store.set_if_current(generation, credentials) {
                    info!("Session renewed");
                    Ok(store.get())
                } else {
                    warn!("Discarding refreshed tokens, session changed meanwhile");
                    Err(RenewError::Superseded)
                }
            }
            Err(err) => {
                warn!(error = %err, "Token refresh failed");
                if !store.clear_if_current(generation) {
                    return Err(RenewError::Superseded);
                }
                Err(err)
            }
        }
    }

    /// Exchange a refresh token that is not in the store (yet), for example
    /// one read back from storage without its user. The store is untouched.
    pub async fn redeem(&self, refresh_token: &str) -> Result<Credentials, RenewError> {
        Self::redeem_with(self.transport.as_ref(), refresh_token).await
    }

    async fn exchange(
        store: &SessionStore,
        transport: &dyn Transport,
    ) -> Result<Credentials, RenewError> {
        let refresh_token = store
            .get()
            .refresh_token()
            .map(str::to_string)
            .ok_or(RenewError::NoRefreshToken)?;
        Self::redeem_with(transport, &refresh_token).await
    }

    async fn redeem_with(
        transport: &dyn Transport,
        refresh_token: &str,
    ) -> Result<Credentials, RenewError> {
        let request = ApiRequest::post(REFRESH_PATH)
            .json(&RefreshTokenRequest { refresh_token })
            .map_err(|e| RenewError::Transport(e.to_string()))?;

        debug!("Requesting token refresh");
        let response = transport
            .execute(&request, None)
            .await
            .map_err(|e| RenewError::Transport(e.to_string()))?;

        if !response.is_success() {
            let message = ApiError::from_status(response.status, &response.body).to_string();
            return Err(RenewError::Rejected {
                status: response.status,
                message,
            });
        }

        decode_auth(&response.body).map_err(|e| RenewError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::api::transport::scripted::{
        auth_body, demo_user, error_body, Reply, ScriptedTransport,
    };
    use crate::auth::storage::MemoryStorage;

    fn logged_in_store() -> Arc<SessionStore> {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())));
        store.set(Credentials::new("A1", "R1", demo_user()));
        store
    }

    #[tokio::test]
    async fn test_renew_success_updates_store() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Json(200, auth_body("A2", "R2"))
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let session = coordinator.renew(Some("A1")).await.expect("renewed");
        assert_eq!(session.access_token(), Some("A2"));
        assert_eq!(store.get().refresh_token(), Some("R2"));

        let calls = transport.calls_to(REFRESH_PATH);
        assert_eq!(calls.len(), 1);
        // The refresh token travels in the body, never as a bearer
        assert_eq!(calls[0].bearer, None);
        assert_eq!(calls[0].body, Some(json!({ "refresh_token": "R1" })));
    }

    #[tokio::test]
    async fn test_concurrent_renewals_share_one_call() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Delayed(Duration::from_millis(50), 200, auth_body("A2", "R2"))
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let outcomes = join_all((0..5).map(|_| coordinator.renew(Some("A1")))).await;

        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        for outcome in outcomes {
            assert_eq!(outcome.expect("shared success").access_token(), Some("A2"));
        }
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_outcome() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Delayed(
                Duration::from_millis(20),
                401,
                error_body("Invalid refresh token"),
            )
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let outcomes = join_all((0..3).map(|_| coordinator.renew(Some("A1")))).await;

        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        for outcome in outcomes {
            assert!(matches!(outcome, Err(RenewError::Rejected { status: 401, .. })));
        }
        assert!(!store.get().is_authenticated());
    }

    #[tokio::test]
    async fn test_already_renewed_skips_backend() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Json(200, auth_body("A9", "R9"))
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        // The failed request carried A0, but the store has moved on to A1
        let session = coordinator.renew(Some("A0")).await.expect("current session");
        assert_eq!(session.access_token(), Some("A1"));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failures_clear_the_session() {
        let replies: [fn() -> Reply; 3] = [
            || Reply::ConnectionRefused,
            || Reply::Json(200, json!({ "data": { "access_token": "A2" } })),
            || Reply::Json(500, error_body("boom")),
        ];
        for reply in replies {
            let store = logged_in_store();
            let transport = Arc::new(ScriptedTransport::new(move |_, _| reply()));
            let coordinator = RefreshCoordinator::new(store.clone(), transport);

            assert!(coordinator.renew(Some("A1")).await.is_err());
            assert!(store.get().access_token().is_none());
            assert!(store.get().user().is_none());
        }
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_fails_without_wedging() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            let mut body = auth_body("A2", "R2");
            body["data"]["expires_in"] = json!(1_000_000_000_000_000i64);
            Reply::Json(200, body)
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), transport.clone());

        let outcome = coordinator.renew(Some("A1")).await;
        assert!(matches!(outcome, Err(RenewError::Malformed(_))));
        assert!(!store.get().is_authenticated());
        assert!(!coordinator.is_renewing());

        // The coordinator keeps working after the bad response
        store.set(Credentials::new("A1", "R1", demo_user()));
        let outcome = coordinator.renew(Some("A1")).await;
        assert!(matches!(outcome, Err(RenewError::Malformed(_))));
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 2);
    }

    #[tokio::test]
    async fn test_no_refresh_token() {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())));
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Json(200, auth_body("A2", "R2"))
        }));
        let coordinator = RefreshCoordinator::new(store, transport.clone());

        assert_eq!(coordinator.renew(None).await, Err(RenewError::NoRefreshToken));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_clear_during_renewal_wins() {
        let store = logged_in_store();
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Reply::Delayed(Duration::from_millis(50), 200, auth_body("A2", "R2"))
        }));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone(), transport));

        let renewing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.renew(Some("A1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.reset();
        store.clear();

        let outcome = renewing.await.expect("task completes");
        assert_eq!(outcome, Err(RenewError::Superseded));
        assert!(!store.get().is_authenticated());
    }
}
