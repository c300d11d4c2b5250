//! Authentication module for managing user sessions.
//!
//! This module provides:
//! - `SessionStore`: the current session, persisted through a `SessionStorage`
//! - `RefreshCoordinator`: single-flight renewal of the token pair
//! - `SessionLifecycle`: login, signup and logout
//! - `RouteGuard`: access decisions derived from the store

pub mod guard;
pub mod lifecycle;
pub mod refresh;
pub mod session;
pub mod storage;

pub use guard::{Access, RouteGuard};
pub use lifecycle::{SessionLifecycle, SignupProfile};
pub use refresh::{RefreshCoordinator, RenewError, RenewOutcome};
pub use session::{Credentials, Generation, Rehydrated, Session, SessionStatus, SessionStore, User};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, PersistedSession, SessionStorage};
