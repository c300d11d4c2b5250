//! Durable session storage backends.
//!
//! - `FileStorage`: `session.json` in the per-user data directory
//! - `KeyringStorage`: named slots in the OS keychain
//! - `MemoryStorage`: process-local, for tests and ephemeral clients

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

use super::session::{Credentials, User};

/// Namespace for every storage backend (directory name, keychain service)
pub const STORAGE_NAMESPACE: &str = "forgebase-admin";

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

const ACCESS_TOKEN_SLOT: &str = "access_token";
const REFRESH_TOKEN_SLOT: &str = "refresh_token";
const SESSION_SLOT: &str = "session";

/// The durable form of a session.
///
/// `user` is optional so that storage holding only the two token slots can
/// still be read; the store decides what to do with such a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSession {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            access_token: credentials.access_token.clone(),
            refresh_token: credentials.refresh_token.clone(),
            user: Some(credentials.user.clone()),
            expires_at: credentials.expires_at,
            saved_at: Utc::now(),
        }
    }

    /// A record older than `max_age` is past the refresh token lifetime
    pub fn is_expired(&self, max_age: Duration) -> bool {
        Utc::now() > self.saved_at + max_age
    }
}

/// Synchronous durable storage for the current session
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>>;
    fn save(&self, session: &PersistedSession) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file storage
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Storage under the platform data directory
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(Self::new(data_dir.join(STORAGE_NAMESPACE)))
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let session: PersistedSession =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(session))
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        std::fs::create_dir_all(&self.dir).context("Failed to create session directory")?;
        let contents = serde_json::to_string_pretty(session)?;

        // Write then rename so a crash never leaves a half-written file
        let tmp = self.dir.join(format!("{}.tmp", SESSION_FILE));
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, self.session_path()).context("Failed to replace session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// OS keychain storage.
///
/// Tokens live in the `access_token` and `refresh_token` slots; the rest of
/// the record (user, timestamps) is kept as JSON in the `session` slot.
pub struct KeyringStorage {
    service: String,
}

#[derive(Serialize, Deserialize)]
struct SessionMeta {
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    saved_at: DateTime<Utc>,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self::with_service(STORAGE_NAMESPACE)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, slot: &str) -> Result<Entry> {
        Entry::new(&self.service, slot).context("Failed to create keyring entry")
    }

    fn read_slot(&self, slot: &str) -> Result<Option<String>> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from keychain", slot)),
        }
    }

    fn write_slot(&self, slot: &str, value: &str) -> Result<()> {
        self.entry(slot)?
            .set_password(value)
            .with_context(|| format!("Failed to store {} in keychain", slot))
    }

    fn delete_slot(&self, slot: &str) -> Result<()> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {} from keychain", slot)),
        }
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStorage for KeyringStorage {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let (Some(access_token), Some(refresh_token)) = (
            self.read_slot(ACCESS_TOKEN_SLOT)?,
            self.read_slot(REFRESH_TOKEN_SLOT)?,
        ) else {
            return Ok(None);
        };

        let meta = match self.read_slot(SESSION_SLOT)? {
            Some(json) => serde_json::from_str::<SessionMeta>(&json)
                .context("Failed to parse session metadata")?,
            None => SessionMeta {
                user: None,
                expires_at: None,
                saved_at: Utc::now(),
            },
        };

        Ok(Some(PersistedSession {
            access_token,
            refresh_token,
            user: meta.user,
            expires_at: meta.expires_at,
            saved_at: meta.saved_at,
        }))
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let meta = SessionMeta {
            user: session.user.clone(),
            expires_at: session.expires_at,
            saved_at: session.saved_at,
        };
        self.write_slot(SESSION_SLOT, &serde_json::to_string(&meta)?)?;
        self.write_slot(REFRESH_TOKEN_SLOT, &session.refresh_token)?;
        self.write_slot(ACCESS_TOKEN_SLOT, &session.access_token)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.delete_slot(ACCESS_TOKEN_SLOT)?;
        self.delete_slot(REFRESH_TOKEN_SLOT)?;
        self.delete_slot(SESSION_SLOT)?;
        Ok(())
    }
}

/// Process-local storage; survives store re-creation but not the process
#[derive(Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<PersistedSession>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: PersistedSession) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("Session storage lock poisoned"))?;
        Ok(slot.clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("Session storage lock poisoned"))?;
        *slot = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("Session storage lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}
