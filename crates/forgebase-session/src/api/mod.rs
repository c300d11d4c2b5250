//! HTTP layer for the ForgeBase REST API.
//!
//! `HttpGateway` is the entry point for authenticated calls. It attaches the
//! bearer token held by the `SessionStore`, and on a 401 asks the
//! `RefreshCoordinator` for a fresh session and replays the call once.
//!
//! The wire format is a JSON envelope: `{"data": ...}` on success and
//! `{"error": {"message": ...}}` on failure (see `envelope`).

pub mod envelope;
pub mod error;
pub mod gateway;
pub mod transport;

pub use envelope::{AuthPayload, HealthStatus, UserPayload};
pub use error::ApiError;
pub use gateway::{Attempt, HttpGateway, SessionEvent};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};

/// Sign-in endpoint
pub const SIGNIN_PATH: &str = "/api/v1/auth/signin";

/// Registration endpoint
pub const SIGNUP_PATH: &str = "/api/v1/auth/signup";

/// Token renewal endpoint
pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Server-side refresh token revocation
pub const SIGNOUT_PATH: &str = "/api/v1/auth/signout";

/// Current user profile
pub const USER_PATH: &str = "/api/v1/auth/user";

/// Unauthenticated health probe
pub const HEALTH_PATH: &str = "/api/v1/health";
