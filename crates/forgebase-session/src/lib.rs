//! Session core for the ForgeBase admin client.
//!
//! This crate owns everything stateful about talking to a ForgeBase backend:
//! - `SessionStore`: the current access/refresh token pair and user, persisted
//!   across restarts and observable through a watch channel
//! - `RefreshCoordinator`: single-flight token renewal
//! - `HttpGateway`: authenticated requests with one renewal-and-replay on 401
//! - `SessionLifecycle`: login, signup and logout
//! - `RouteGuard`: allowed vs redirect-to-login decisions
//!
//! `AdminClient` wires all of them together from a `Config`.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;

pub use api::{ApiError, ApiRequest, ApiResponse, Attempt, HttpGateway, SessionEvent, Transport};
pub use auth::{
    Access, Credentials, RefreshCoordinator, RenewError, RouteGuard, Session, SessionLifecycle,
    SessionStore, SignupProfile, User,
};
pub use client::AdminClient;
pub use config::{Config, StorageBackend};
