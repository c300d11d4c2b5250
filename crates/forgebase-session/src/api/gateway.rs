//! Authenticated request gateway.
//!
//! Every call made on behalf of the user goes through `HttpGateway::send`:
//! the current access token is attached, and a 401 on the first attempt
//! triggers one renewal and one replay.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{RefreshCoordinator, RenewError, SessionStore};

use super::{ApiError, ApiRequest, ApiResponse, Transport};

/// Buffer size for session event subscribers.
/// Events are rare (one per invalidation), so a handful is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Which attempt of a request this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retried,
}

impl Attempt {
    /// Only a first attempt may trigger renewal-and-replay
    pub fn may_recover(self) -> bool {
        matches!(self, Attempt::First)
    }
}

/// Signals for the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session could not be renewed and was cleared; show the login screen
    Invalidated { reason: String },
}

pub struct HttpGateway {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    refresher: Arc<RefreshCoordinator>,
    events: broadcast::Sender<SessionEvent>,
}

impl HttpGateway {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            refresher,
            events,
        }
    }

    /// Subscribe to session invalidation signals
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send `request` with the current session.
    ///
    /// A 401 is repaired by one renewal and one replay; the replay's outcome
    /// is returned as-is. If renewal fails, the original 401 is returned and
    /// `SessionEvent::Invalidated` is broadcast. Any other status, and any
    /// transport failure, passes through untouched.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.send_attempt(request, Attempt::First).await
    }

    /// Send `request` without a bearer credential and without recovery
    pub async fn send_anonymous(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        debug!(method = %request.method, path = %request.path, "Sending anonymous request");
        self.transport.execute(request, None).await
    }

    /// Send `request` with an explicit bearer token, without recovery.
    /// Used to validate tokens that are not (yet) in the store.
    pub async fn send_as(&self, request: &ApiRequest, bearer: &str) -> Result<ApiResponse, ApiError> {
        debug!(method = %request.method, path = %request.path, "Sending request with explicit token");
        self.transport.execute(request, Some(bearer)).await
    }

    /// GET `path` and decode the `data` of the response envelope
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(&ApiRequest::get(path)).await?.into_data()
    }

    /// POST `body` to `path` and decode the `data` of the response envelope
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::post(path).json(body)?;
        self.send(&request).await?.into_data()
    }

    /// One pass of the request. Only `Attempt::First` may renew and replay;
    /// a retried request's outcome is final.
    fn send_attempt<'a>(
        &'a self,
        request: &'a ApiRequest,
        attempt: Attempt,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        async move {
            // Read the token at send time, after any renewal has settled
            let bearer = self.store.get().access_token().map(str::to_string);
            debug!(
                method = %request.method,
                path = %request.path,
                ?attempt,
                authenticated = bearer.is_some(),
                "Dispatching request"
            );
            let response = self.transport.execute(request, bearer.as_deref()).await?;

            if !response.is_unauthorized() {
                return Ok(response);
            }
            if !attempt.may_recover() {
                warn!(path = %request.path, "Still unauthorized after renewal, giving up");
                return Ok(response);
            }

            debug!(path = %request.path, "Unauthorized, renewing session");
            match self.refresher.renew(bearer.as_deref()).await {
                Ok(_) => self.send_attempt(request, Attempt::Retried).await,
                Err(err) => {
                    self.invalidate(&err);
                    Ok(response)
                }
            }
        }
        .boxed()
    }

    fn invalidate(&self, err: &RenewError) {
        // A newer session (fresh login or logout) owns the store now
        if *err == RenewError::Superseded {
            debug!("Renewal superseded, not signalling invalidation");
            return;
        }
        // The coordinator has already cleared the store
        info!(reason = %err, "Session invalidated, redirecting to login");
        // No subscribers is fine
        let _ = self.events.send(SessionEvent::Invalidated {
            reason: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use serde_json::{json, Value};

    use super::*;
    use crate::api::transport::scripted::{
        auth_body, demo_user, error_body, Reply, ScriptedTransport,
    };
    use crate::api::REFRESH_PATH;
    use crate::auth::storage::MemoryStorage;
    use crate::auth::Credentials;

    const SITES_PATH: &str = "/api/v1/sites";

    fn gateway_with<F>(handler: F) -> (Arc<SessionStore>, Arc<ScriptedTransport>, HttpGateway)
    where
        F: Fn(&ApiRequest, Option<&str>) -> Reply + Send + Sync + 'static,
    {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())));
        store.set(Credentials::new("A1", "R1", demo_user()));
        let transport = Arc::new(ScriptedTransport::new(handler));
        let refresher = Arc::new(RefreshCoordinator::new(store.clone(), transport.clone()));
        let gateway = HttpGateway::new(store.clone(), transport.clone(), refresher);
        (store, transport, gateway)
    }

    fn sites() -> Value {
        json!({ "data": [{ "id": "s1", "name": "docs" }] })
    }

    #[tokio::test]
    async fn test_attaches_bearer() {
        let (_, transport, gateway) = gateway_with(|_, _| Reply::Json(200, sites()));

        let response = gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls()[0].bearer.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_no_token_sends_unauthenticated() {
        let (store, transport, gateway) = gateway_with(|_, _| Reply::Json(200, sites()));
        store.clear();

        gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap();
        assert_eq!(transport.calls()[0].bearer, None);
    }

    #[tokio::test]
    async fn test_renews_and_replays_on_401() {
        let (store, transport, gateway) = gateway_with(|request, bearer| {
            if request.path == REFRESH_PATH {
                Reply::Json(200, auth_body("A2", "R2"))
            } else if bearer == Some("A2") {
                Reply::Json(200, sites())
            } else {
                Reply::Json(401, error_body("Token has expired"))
            }
        });

        let sites: Value = gateway.get_json(SITES_PATH).await.expect("replayed");
        assert_eq!(sites[0]["name"], "docs");

        let bearers: Vec<_> = transport
            .calls_to(SITES_PATH)
            .into_iter()
            .map(|c| c.bearer)
            .collect();
        assert_eq!(bearers, vec![Some("A1".to_string()), Some("A2".to_string())]);
        assert_eq!(store.get().access_token(), Some("A2"));
        assert_eq!(store.get().refresh_token(), Some("R2"));
    }

    #[tokio::test]
    async fn test_retries_only_once() {
        let (_, transport, gateway) = gateway_with(|request, _| {
            if request.path == REFRESH_PATH {
                Reply::Json(200, auth_body("A2", "R2"))
            } else {
                Reply::Json(401, error_body("Token has expired"))
            }
        });

        let response = gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(transport.calls_to(SITES_PATH).len(), 2);
        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_retried_attempt_never_renews() {
        let (store, transport, gateway) = gateway_with(|request, _| {
            if request.path == REFRESH_PATH {
                Reply::Json(200, auth_body("A2", "R2"))
            } else {
                Reply::Json(401, error_body("Token has expired"))
            }
        });

        let response = gateway
            .send_attempt(&ApiRequest::get(SITES_PATH), Attempt::Retried)
            .await
            .unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(transport.calls().len(), 1);
        assert!(transport.calls_to(REFRESH_PATH).is_empty());
        assert_eq!(store.get().access_token(), Some("A1"));
    }

    #[tokio::test]
    async fn test_failed_renewal_returns_original_401_and_signals() {
        let (store, transport, gateway) = gateway_with(|request, _| {
            if request.path == REFRESH_PATH {
                Reply::Json(401, error_body("Refresh token revoked"))
            } else {
                Reply::Json(401, error_body("Token has expired"))
            }
        });
        let mut events = gateway.events();

        let response = gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(response.body.contains("Token has expired"));
        assert_eq!(transport.calls_to(SITES_PATH).len(), 1);
        assert!(!store.get().is_authenticated());

        match events.try_recv() {
            Ok(SessionEvent::Invalidated { reason }) => assert!(reason.contains("rejected")),
            other => panic!("expected invalidation, got {other:?}"),
        }

        let err = gateway.get_json::<Value>(SITES_PATH).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_other_statuses_pass_through() {
        for status in [400u16, 403, 404, 422, 500, 503] {
            let (store, transport, gateway) =
                gateway_with(move |_, _| Reply::Json(status, error_body("nope")));

            let response = gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap();
            assert_eq!(response.status, status);
            assert_eq!(transport.calls().len(), 1);
            assert_eq!(store.get().access_token(), Some("A1"));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_passes_through() {
        let (store, transport, gateway) = gateway_with(|_, _| Reply::ConnectionRefused);

        let err = gateway.send(&ApiRequest::get(SITES_PATH)).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.calls().len(), 1);
        assert!(store.get().is_authenticated());
    }

    #[tokio::test]
    async fn test_concurrent_401s_single_refresh() {
        let (store, transport, gateway) = gateway_with(|request, bearer| {
            if request.path == REFRESH_PATH {
                Reply::Delayed(Duration::from_millis(50), 200, auth_body("A2", "R2"))
            } else if bearer == Some("A2") {
                Reply::Json(200, sites())
            } else {
                Reply::Json(401, error_body("Token has expired"))
            }
        });

        let request = ApiRequest::get(SITES_PATH);
        let responses = join_all((0..4).map(|_| gateway.send(&request))).await;

        assert_eq!(transport.calls_to(REFRESH_PATH).len(), 1);
        for response in responses {
            assert_eq!(response.unwrap().status, 200);
        }
        let replays = transport
            .calls_to(SITES_PATH)
            .into_iter()
            .filter(|c| c.bearer.as_deref() == Some("A2"))
            .count();
        assert_eq!(replays, 4);
        assert_eq!(store.get().access_token(), Some("A2"));
    }

    #[tokio::test]
    async fn test_post_json_round_trip() {
        let (_, transport, gateway) = gateway_with(|request, _| {
            let name = request.body.as_ref().map(|b| b["name"].clone()).unwrap_or_default();
            Reply::Json(201, json!({ "data": { "id": "s2", "name": name } }))
        });

        let created: Value = gateway
            .post_json(SITES_PATH, &json!({ "name": "blog" }))
            .await
            .unwrap();
        assert_eq!(created["name"], "blog");
        assert_eq!(transport.calls()[0].method, "POST");
    }
}
