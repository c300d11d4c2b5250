//! `AdminClient`: the session core wired up from a `Config`.
//!
//! This is what a UI collaborator holds. It exposes the session snapshot and
//! change notifications, the lifecycle entry points, the route guard and the
//! authenticated gateway.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{
    ApiError, ApiRequest, HealthStatus, HttpGateway, ReqwestTransport, SessionEvent, Transport,
    UserPayload, HEALTH_PATH, USER_PATH,
};
use crate::auth::{
    Credentials, FileStorage, KeyringStorage, RefreshCoordinator, Rehydrated, RenewError, RouteGuard,
    Session, SessionLifecycle, SessionStorage, SessionStore, SignupProfile, User,
};
use crate::config::{Config, StorageBackend};

pub struct AdminClient {
    store: Arc<SessionStore>,
    refresher: Arc<RefreshCoordinator>,
    gateway: Arc<HttpGateway>,
    lifecycle: SessionLifecycle,
    guard: RouteGuard,
}

impl AdminClient {
    /// Build a client talking to the configured backend with the configured
    /// storage. Does not touch storage or the network; call `restore` next.
    pub fn new(config: &Config) -> Result<Self> {
        let storage: Arc<dyn SessionStorage> = match config.storage {
            StorageBackend::File => Arc::new(FileStorage::new(config.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new()),
        };
        let transport = Arc::new(ReqwestTransport::new(
            &config.api_url(),
            config.request_timeout(),
        )?);
        debug!(api_url = %transport.base_url(), storage = ?config.storage, "Client configured");

        Ok(Self::with_parts(config, storage, transport))
    }

    /// Build a client from explicit storage and transport
    pub fn with_parts(
        config: &Config,
        storage: Arc<dyn SessionStorage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = Arc::new(SessionStore::with_max_age(storage, config.session_max_age()));
        let refresher = Arc::new(RefreshCoordinator::new(store.clone(), transport.clone()));
        let gateway = Arc::new(HttpGateway::new(store.clone(), transport, refresher.clone()));
        let lifecycle = SessionLifecycle::new(store.clone(), gateway.clone(), refresher.clone())
            .with_revoke_on_logout(config.revoke_on_logout);
        let guard = RouteGuard::new(store.clone());

        Self {
            store,
            refresher,
            gateway,
            lifecycle,
            guard,
        }
    }

    /// Rehydrate the session from durable storage.
    ///
    /// When storage held tokens but no user, the user is fetched with the
    /// stored access token. A rejected access token is renewed with the
    /// stored refresh token. The stored tokens are discarded only when the
    /// backend rejects both; any other failure leaves storage as it was and
    /// the session signed out for this run.
    pub async fn restore(&self) -> Session {
        match self.store.initialize() {
            Rehydrated::Restored(session) => {
                info!("Restored saved session");
                session
            }
            Rehydrated::Empty => self.store.get(),
            Rehydrated::TokensOnly {
                access_token,
                refresh_token,
            } => {
                let generation = self.store.generation();
                match self.rebuild_session(access_token, refresh_token).await {
                    Ok(Some(credentials)) => {
                        if self.store.set_if_current(generation, credentials) {
                            info!("Restored saved session, user re-fetched");
                        }
                    }
                    Ok(None) => {
                        warn!("Saved tokens were rejected, discarding them");
                        self.store.clear_if_current(generation);
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not validate saved tokens, keeping them");
                    }
                }
                self.store.get()
            }
        }
    }

    /// `Ok(None)` means the backend rejected the saved tokens; `Err` means
    /// it could not be asked.
    async fn rebuild_session(
        &self,
        access_token: String,
        refresh_token: String,
    ) -> Result<Option<Credentials>, String> {
        match self.fetch_user(&access_token).await {
            Ok(user) => return Ok(Some(Credentials::new(access_token, refresh_token, user))),
            Err(ApiError::Unauthorized(_)) => {
                debug!("Saved access token rejected, renewing");
            }
            Err(e) => return Err(e.to_string()),
        }

        match self.refresher.redeem(&refresh_token).await {
            Ok(credentials) => Ok(Some(credentials)),
            Err(RenewError::Transport(e)) => Err(e),
            Err(RenewError::Rejected { status, message }) if status >= 500 || status == 429 => {
                Err(format!("{} ({})", message, status))
            }
            Err(e) => {
                debug!(error = %e, "Saved refresh token rejected");
                Ok(None)
            }
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, ApiError> {
        self.gateway
            .send_as(&ApiRequest::get(USER_PATH), access_token)
            .await?
            .into_data::<UserPayload>()?
            .into_user()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        self.lifecycle.login(email, password).await
    }

    pub async fn signup(&self, profile: &SignupProfile) -> Result<Session, ApiError> {
        self.lifecycle.signup(profile).await
    }

    pub async fn logout(&self) {
        self.lifecycle.logout().await
    }

    /// Current session snapshot
    pub fn session(&self) -> Session {
        self.store.get()
    }

    /// Session change notifications
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.store.subscribe()
    }

    /// Invalidation signals (redirect to login)
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.gateway.events()
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    pub fn gateway(&self) -> &HttpGateway {
        &self.gateway
    }

    /// The signed-in user, if any
    pub fn current_user(&self) -> Option<User> {
        self.store.get().user().cloned()
    }

    /// Re-fetch the signed-in user's profile and update the session
    pub async fn refresh_profile(&self) -> Result<User, ApiError> {
        let user = self
            .gateway
            .get_json::<UserPayload>(USER_PATH)
            .await?
            .into_user()?;
        if !self.store.set_user(user.clone()) {
            debug!("Session ended while fetching profile");
        }
        Ok(user)
    }

    /// Backend health probe
    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.gateway.get_json(HEALTH_PATH).await
    }
}
