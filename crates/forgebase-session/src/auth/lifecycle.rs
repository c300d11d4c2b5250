use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::api::envelope::{decode_auth, RefreshTokenRequest, SignInRequest, SignUpRequest};
use crate::api::{ApiError, ApiRequest, HttpGateway, SIGNIN_PATH, SIGNOUT_PATH, SIGNUP_PATH};

use super::refresh::RefreshCoordinator;
use super::session::{Credentials, Session, SessionStore};

/// Fields collected by the registration form
#[derive(Debug, Clone, Default)]
pub struct SignupProfile {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

/// Entry points that create or destroy a session
pub struct SessionLifecycle {
    store: Arc<SessionStore>,
    gateway: Arc<HttpGateway>,
    refresher: Arc<RefreshCoordinator>,
    revoke_on_logout: bool,
}

impl SessionLifecycle {
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<HttpGateway>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            store,
            gateway,
            refresher,
            revoke_on_logout: true,
        }
    }

    /// Whether logout also revokes the refresh token on the server
    pub fn with_revoke_on_logout(mut self, revoke: bool) -> Self {
        self.revoke_on_logout = revoke;
        self
    }

    /// Sign in with email and password.
    ///
    /// On failure the current session is left as it was and the error's
    /// `user_message` is recorded as `status.last_error`.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return self.fail(
                ApiError::Validation("Email and password required".to_string()),
                "Login failed",
            );
        }

        let request = ApiRequest::post(SIGNIN_PATH).json(&SignInRequest { email, password })?;
        let result = self.authenticate(&request).await;
        match result {
            Ok(session) => {
                info!(user_id = ?session.user().map(|u| &u.id), "Login successful");
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                self.fail(e, "Login failed")
            }
        }
    }

    /// Register a new account and sign in with it
    pub async fn signup(&self, profile: &SignupProfile) -> Result<Session, ApiError> {
        let full_name = profile.full_name.trim();
        let email = profile.email.trim();
        if full_name.is_empty() || email.is_empty() || profile.password.is_empty() {
            return self.fail(
                ApiError::Validation("Full name, email and password required".to_string()),
                "Signup failed",
            );
        }

        let request = ApiRequest::post(SIGNUP_PATH).json(&SignUpRequest {
            full_name,
            email,
            password: &profile.password,
        })?;
        match self.authenticate(&request).await {
            Ok(session) => {
                info!(user_id = ?session.user().map(|u| &u.id), "Signup successful");
                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Signup failed");
                self.fail(e, "Signup failed")
            }
        }
    }

    /// Drop the session.
    ///
    /// Local state is cleared first, so an in-flight renewal can never bring
    /// it back. The refresh token is then revoked on a best-effort basis.
    pub async fn logout(&self) {
        let previous = self.store.get();

        self.refresher.reset();
        self.store.clear();
        self.store.set_error(None);

        let Some(refresh_token) = previous.refresh_token() else {
            debug!("Logout without a session");
            return;
        };
        info!("Logged out");

        if !self.revoke_on_logout {
            return;
        }
        let request = match ApiRequest::post(SIGNOUT_PATH).json(&RefreshTokenRequest { refresh_token }) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Failed to build sign-out request");
                return;
            }
        };
        match self.gateway.send_anonymous(&request).await {
            Ok(response) if response.is_success() => debug!("Refresh token revoked"),
            Ok(response) => warn!(status = response.status, "Server rejected sign-out"),
            Err(e) => warn!(error = %e, "Failed to revoke refresh token"),
        }
    }

    async fn authenticate(&self, request: &ApiRequest) -> Result<Session, ApiError> {
        self.store.set_error(None);
        self.store.set_loading(true);
        let result = self.exchange(request).await;
        self.store.set_loading(false);

        let credentials = result?;
        // A renewal still running for the old session must not overwrite this one
        self.refresher.reset();
        self.store.set(credentials);
        Ok(self.store.get())
    }

    async fn exchange(&self, request: &ApiRequest) -> Result<Credentials, ApiError> {
        // No bearer and no renewal: a 401 here means bad credentials
        let response = self.gateway.send_anonymous(request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        decode_auth(&response.body)
    }

    fn fail(&self, err: ApiError, fallback: &str) -> Result<Session, ApiError> {
        self.store.set_error(Some(err.user_message(fallback)));
        Err(err)
    }
}
