//! Wire schemas for the ForgeBase JSON envelope.
//!
//! Every success body is `{"data": ...}` and every failure body is
//! `{"error": {"message": ...}}`. Auth responses are validated here so that a
//! payload with a missing or empty field never becomes a partial session.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::auth::{Credentials, User};

use super::ApiError;

#[derive(Debug, Deserialize)]
struct SuccessEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// User object as returned by the auth endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: String,
    pub email: String,
    pub full_name: String,
}

/// `data` of the signin, signup and refresh responses
#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserPayload,
    /// Access token lifetime in seconds, when the backend reports it
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// `data` of `GET /api/v1/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignInRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignUpRequest<'a> {
    pub full_name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
}

/// Extract `error.message` from a failure body, if there is a usable one
pub fn error_message(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    envelope
        .error
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}

/// Decode the `data` field of a success body
pub fn decode_data<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str::<SuccessEnvelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|e| ApiError::InvalidResponse(format!("Malformed response envelope: {}", e)))
}

/// Decode and validate an auth response into a complete credential set
pub fn decode_auth(body: &str) -> Result<Credentials, ApiError> {
    decode_data::<AuthPayload>(body)?.into_credentials()
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidResponse(format!(
            "Auth response has an empty {}",
            field
        )));
    }
    Ok(())
}

fn expiry_from_now(secs: i64) -> Result<DateTime<Utc>, ApiError> {
    Duration::try_seconds(secs)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            ApiError::InvalidResponse(format!("Auth response has an out-of-range expires_in: {}", secs))
        })
}

impl UserPayload {
    pub fn into_user(self) -> Result<User, ApiError> {
        require("user.id", &self.id)?;
        require("user.email", &self.email)?;
        Ok(User {
            id: self.id,
            email: self.email,
            display_name: self.full_name,
        })
    }
}

impl AuthPayload {
    pub fn into_credentials(self) -> Result<Credentials, ApiError> {
        require("access_token", &self.access_token)?;
        require("refresh_token", &self.refresh_token)?;
        let user = self.user.into_user()?;
        let expires_at = match self.expires_in.filter(|secs| *secs > 0) {
            Some(secs) => Some(expiry_from_now(secs)?),
            None => None,
        };

        Ok(Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user,
            expires_at,
        })
    }
}
