use std::sync::Arc;

use super::session::SessionStore;

/// Where unauthenticated users are sent
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";

/// Paths reachable without a session
const DEFAULT_PUBLIC_PATHS: &[&str] = &["/", "/login", "/auth/login", "/auth/signup"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Redirect(String),
}

/// Access decisions derived from the session store on every call.
/// Holds no state of its own and never modifies the session.
pub struct RouteGuard {
    store: Arc<SessionStore>,
    login_path: String,
    public_paths: Vec<String>,
}

impl RouteGuard {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            public_paths: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_login_path(mut self, login_path: impl Into<String>) -> Self {
        self.login_path = login_path.into();
        self
    }

    pub fn with_public_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn is_allowed(&self) -> bool {
        self.store.get().access_token().is_some()
    }

    pub fn check(&self, path: &str) -> Access {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let normalized = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        if self.public_paths.iter().any(|p| p == normalized) || self.is_allowed() {
            Access::Allowed
        } else {
            Access::Redirect(self.login_path.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::scripted::demo_user;
    use crate::auth::storage::MemoryStorage;
    use crate::auth::Credentials;

    fn guard() -> (Arc<SessionStore>, RouteGuard) {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())));
        (store.clone(), RouteGuard::new(store))
    }

    fn login(store: &SessionStore) {
        store.set(Credentials::new("A1", "R1", demo_user()));
    }

    #[test]
    fn test_follows_store() {
        let (store, guard) = guard();
        assert!(!guard.is_allowed());
        assert_eq!(guard.check("/dashboard"), Access::Redirect("/auth/login".to_string()));

        login(&store);
        assert!(guard.is_allowed());
        assert_eq!(guard.check("/dashboard/users"), Access::Allowed);

        store.clear();
        assert!(!guard.is_allowed());
    }

    #[test]
    fn test_public_paths() {
        let (_, guard) = guard();
        assert_eq!(guard.check("/"), Access::Allowed);
        assert_eq!(guard.check("/auth/login"), Access::Allowed);
        assert_eq!(guard.check("/auth/signup/"), Access::Allowed);
        assert_eq!(guard.check("/auth/signup?next=/sites"), Access::Allowed);
        assert_ne!(guard.check("/settings"), Access::Allowed);
    }

    #[test]
    fn test_custom_routes() {
        let (store, _) = guard();
        let guard = RouteGuard::new(store.clone())
            .with_login_path("/login")
            .with_public_paths(["/login"]);
        assert_eq!(guard.login_path(), "/login");
        assert_eq!(guard.check("/"), Access::Redirect("/login".to_string()));

        // Checking never touches the session
        let before = store.generation();
        let _ = guard.check("/users");
        assert_eq!(store.generation(), before);
    }
}
