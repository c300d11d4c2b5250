use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::storage::{PersistedSession, SessionStorage};

/// Default age after which a persisted session is discarded on startup.
/// Matches the backend's refresh token lifetime.
pub const DEFAULT_SESSION_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// Access token, refresh token and user: always set and cleared together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>, user: User) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            user,
            expires_at: None,
        }
    }

    fn from_persisted(persisted: PersistedSession, user: User) -> Self {
        Self {
            access_token: persisted.access_token,
            refresh_token: persisted.refresh_token,
            user,
            expires_at: persisted.expires_at,
        }
    }
}

/// Transient UI status; never persisted and never consulted by session logic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub loading: bool,
    pub last_error: Option<String>,
}

/// Snapshot of the current session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    credentials: Option<Credentials>,
    pub status: SessionStatus,
}

impl Session {
    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.refresh_token.as_str())
    }

    pub fn user(&self) -> Option<&User> {
        self.credentials.as_ref().map(|c| &c.user)
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.credentials.as_ref().and_then(|c| c.expires_at)
    }

    /// Minutes left on the access token, when the backend reported a lifetime
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at()
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}

/// Identifies which session a pending write belongs to.
///
/// Bumped by every `set` and `clear`, so work started against one session
/// cannot land on its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

/// What `SessionStore::initialize` found in durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rehydrated {
    /// A complete session was restored into the store
    Restored(Session),
    /// Storage held tokens without a user; the store was left empty
    TokensOnly {
        access_token: String,
        refresh_token: String,
    },
    /// Nothing usable was stored
    Empty,
}

struct Inner {
    generation: u64,
}

/// Owner of the current session.
///
/// Writes go through to durable storage before subscribers are notified.
/// Storage failures are logged and never block the in-memory change.
pub struct SessionStore {
    inner: Mutex<Inner>,
    state: watch::Sender<Session>,
    storage: Arc<dyn SessionStorage>,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self::with_max_age(storage, Duration::days(DEFAULT_SESSION_MAX_AGE_DAYS))
    }

    pub fn with_max_age(storage: Arc<dyn SessionStorage>, max_age: Duration) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            inner: Mutex::new(Inner { generation: 0 }),
            state,
            storage,
            max_age,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current snapshot
    pub fn get(&self) -> Session {
        self.state.borrow().clone()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> Generation {
        Generation(self.lock().generation)
    }

    /// Rehydrate from durable storage. Call once at startup, before the
    /// first request.
    pub fn initialize(&self) -> Rehydrated {
        let persisted = match self.storage.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                debug!("No stored session");
                return Rehydrated::Empty;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load stored session, discarding it");
                self.persist_clear();
                return Rehydrated::Empty;
            }
        };

        if persisted.is_expired(self.max_age) {
            info!(saved_at = %persisted.saved_at, "Stored session expired");
            self.persist_clear();
            return Rehydrated::Empty;
        }

        match persisted.user.clone() {
            Some(user) => {
                let credentials = Credentials::from_persisted(persisted, user);
                let mut inner = self.lock();
                inner.generation += 1;
                self.state.send_modify(|session| session.credentials = Some(credentials));
                drop(inner);
                debug!("Session restored from storage");
                Rehydrated::Restored(self.get())
            }
            None => {
                debug!("Stored session has no user");
                Rehydrated::TokensOnly {
                    access_token: persisted.access_token,
                    refresh_token: persisted.refresh_token,
                }
            }
        }
    }

    /// Install a complete session
    pub fn set(&self, credentials: Credentials) {
        let mut inner = self.lock();
        inner.generation += 1;
        self.write(credentials);
    }

    /// Install `credentials` only if no `set`/`clear` happened since
    /// `generation` was read.
    pub fn set_if_current(&self, generation: Generation, credentials: Credentials) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation.0 {
            return false;
        }
        inner.generation += 1;
        self.write(credentials);
        true
    }

    /// Drop the session
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        self.erase();
    }

    /// Drop the session only if no `set`/`clear` happened since `generation`
    pub fn clear_if_current(&self, generation: Generation) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation.0 {
            return false;
        }
        inner.generation += 1;
        self.erase();
        true
    }

    /// Replace the user of the current session. No-op when logged out.
    pub fn set_user(&self, user: User) -> bool {
        let _inner = self.lock();
        let Some(mut credentials) = self.get().credentials else {
            return false;
        };
        credentials.user = user;
        self.persist(&credentials);
        self.state
            .send_modify(|session| session.credentials = Some(credentials));
        true
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.send_if_modified(|session| {
            let changed = session.status.loading != loading;
            session.status.loading = loading;
            changed
        });
    }

    pub fn set_error(&self, error: Option<String>) {
        self.state.send_if_modified(|session| {
            let changed = session.status.last_error != error;
            session.status.last_error = error;
            changed
        });
    }

    // Callers hold the inner lock so storage and memory change in the same order.
    fn write(&self, credentials: Credentials) {
        self.persist(&credentials);
        self.state.send_modify(|session| {
            session.credentials = Some(credentials);
            session.status.last_error = None;
        });
    }

    fn erase(&self) {
        self.persist_clear();
        self.state.send_modify(|session| {
            session.credentials = None;
            session.status.loading = false;
        });
    }

    fn persist(&self, credentials: &Credentials) {
        if let Err(e) = self.storage.save(&PersistedSession::from_credentials(credentials)) {
            warn!(error = %e, "Failed to save session");
        }
    }

    fn persist_clear(&self) {
        if let Err(e) = self.storage.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
    }
}
