//! Users and the sessions they own.
//!
//! A user keeps two maps of weak session references: sessions that are
//! bound (the user is logged in and they may connect) and sessions waiting
//! for the user to log in again. A session is in at most one of the two.

use crate::error::{SyncError, SyncResult};
use crate::manager::SyncManager;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Login state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserState {
    /// Logged out; sessions wait for the next login.
    LoggedOut,
    /// Logged in.
    Active,
    /// Invalidated by a fatal authentication error.
    Error,
}

/// Kind of token a user holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TokenType {
    /// A refresh token from the auth server; persisted.
    #[default]
    Normal,
    /// An administrator token; never persisted and never logged out.
    Admin,
}

/// How a session is registered with its user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    /// Default per-URL path, keyed by remote URL.
    DefaultPath(String),
    /// Host-chosen file name, keyed by local path.
    CustomPath(PathBuf),
}

struct Inner {
    state: UserState,
    refresh_token: String,
    bound: HashMap<SessionKey, Weak<Session>>,
    waiting: HashMap<SessionKey, Weak<Session>>,
}

impl Inner {
    fn prune(&mut self) {
        self.bound.retain(|_, session| session.strong_count() > 0);
        self.waiting.retain(|_, session| session.strong_count() > 0);
    }
}

/// An authenticated identity.
pub struct User {
    identity: String,
    server_url: String,
    local_identity: String,
    token_type: TokenType,
    manager: Weak<SyncManager>,
    inner: Mutex<Inner>,
}

impl User {
    pub(crate) fn new(
        identity: &str,
        refresh_token: &str,
        server_url: &str,
        local_identity: &str,
        token_type: TokenType,
        manager: Weak<SyncManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.to_string(),
            server_url: server_url.to_string(),
            local_identity: local_identity.to_string(),
            token_type,
            manager,
            inner: Mutex::new(Inner {
                state: UserState::Active,
                refresh_token: refresh_token.to_string(),
                bound: HashMap::new(),
                waiting: HashMap::new(),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(identity: &str, refresh_token: &str, server_url: &str) -> Arc<Self> {
        Self::new(
            identity,
            refresh_token,
            server_url,
            identity,
            TokenType::Normal,
            Weak::new(),
        )
    }

    /// Returns the identity assigned by the auth provider.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the auth server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Returns the local identifier used as the user's directory name.
    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Returns the token type.
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Returns true for administrator users.
    pub fn is_admin(&self) -> bool {
        self.token_type == TokenType::Admin
    }

    /// Returns the login state.
    pub fn state(&self) -> UserState {
        self.inner.lock().state
    }

    /// Returns the current refresh token.
    pub fn refresh_token(&self) -> String {
        self.inner.lock().refresh_token.clone()
    }

    /// Returns the live bound sessions.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.bound.values().filter_map(Weak::upgrade).collect()
    }

    /// Returns the live sessions waiting for the user to log in.
    pub fn waiting_sessions(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.waiting.values().filter_map(Weak::upgrade).collect()
    }

    /// Returns the bound session for a local path.
    pub fn session_for_on_disk_path(&self, path: &Path) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner
            .bound
            .values()
            .filter_map(Weak::upgrade)
            .find(|session| session.path() == path)
    }

    /// Registers a session owned by this user.
    ///
    /// A logged-in user binds the session at once: administrators with their
    /// token, everyone else through the session's bind callback. A logged-out
    /// user parks it until the next login. An invalidated user ignores it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateDefaultSession`] if another live
    /// default-path session for the same URL is registered at a different
    /// path.
    pub fn register_session(&self, session: &Arc<Session>) -> SyncResult<()> {
        let config = session.config();
        let key = if config.uses_default_path() {
            SessionKey::DefaultPath(config.realm_url.clone())
        } else {
            SessionKey::CustomPath(session.path().to_path_buf())
        };

        let token = {
            let mut inner = self.inner.lock();
            inner.prune();

            if let SessionKey::DefaultPath(url) = &key {
                let existing = inner
                    .bound
                    .get(&key)
                    .or_else(|| inner.waiting.get(&key))
                    .and_then(Weak::upgrade);
                if let Some(existing) = existing {
                    if existing.path() != session.path() {
                        return Err(SyncError::DuplicateDefaultSession {
                            identity: self.identity.clone(),
                            url: url.clone(),
                        });
                    }
                }
            }

            match inner.state {
                UserState::Active => {
                    inner.waiting.remove(&key);
                    inner.bound.insert(key, Arc::downgrade(session));
                    Some(inner.refresh_token.clone())
                }
                UserState::LoggedOut => {
                    inner.bound.remove(&key);
                    inner.waiting.insert(key, Arc::downgrade(session));
                    None
                }
                UserState::Error => {
                    debug!(user = %self.identity, path = %session.path().display(), "registration dropped for invalidated user");
                    None
                }
            }
        };

        if let Some(token) = token {
            if self.is_admin() {
                session.bind_with_admin_token(&token, &config.realm_url);
            } else {
                session.revive_if_needed();
            }
        }
        Ok(())
    }

    /// Stores a new refresh token. A logged-out user becomes active and its
    /// waiting sessions are revived.
    pub fn update_refresh_token(&self, refresh_token: &str) {
        let revived = {
            let mut inner = self.inner.lock();
            match inner.state {
                UserState::Error => return,
                UserState::Active => {
                    inner.refresh_token = refresh_token.to_string();
                    Vec::new()
                }
                UserState::LoggedOut => {
                    inner.refresh_token = refresh_token.to_string();
                    inner.state = UserState::Active;
                    let waiting = std::mem::take(&mut inner.waiting);
                    let mut revived = Vec::with_capacity(waiting.len());
                    for (key, weak) in waiting {
                        if let Some(session) = weak.upgrade() {
                            revived.push(session);
                            inner.bound.insert(key, weak);
                        }
                    }
                    info!(user = %self.identity, sessions = revived.len(), "user logged in");
                    revived
                }
            }
        };

        if !self.is_admin() {
            self.persist(|manager| {
                manager.perform_metadata_update(|store| {
                    store.set_user_token(&self.identity, &self.server_url, Some(refresh_token))
                })
            });
        }

        for session in revived {
            session.revive_if_needed();
        }
    }

    /// Logs the user out. Bound sessions are logged out and parked until the
    /// next login, and the persisted record is marked for removal.
    /// Administrators cannot log out.
    pub fn log_out(&self) {
        if self.is_admin() {
            return;
        }

        let sessions = {
            let mut inner = self.inner.lock();
            if inner.state != UserState::Active {
                return;
            }
            inner.state = UserState::LoggedOut;
            let bound = std::mem::take(&mut inner.bound);
            let mut sessions = Vec::with_capacity(bound.len());
            for (key, weak) in bound {
                if let Some(session) = weak.upgrade() {
                    sessions.push(session);
                    inner.waiting.insert(key, weak);
                }
            }
            sessions
        };
        info!(user = %self.identity, sessions = sessions.len(), "user logged out");

        for session in &sessions {
            session.log_out();
        }

        self.persist(|manager| {
            manager.perform_metadata_update(|store| store.mark_user_for_removal(&self.identity))
        });
    }

    /// Marks the user as invalidated. Further registrations are ignored.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        if inner.state != UserState::Error {
            warn!(user = %self.identity, "user invalidated");
            inner.state = UserState::Error;
        }
    }

    fn persist(&self, update: impl FnOnce(&SyncManager) -> SyncResult<bool>) {
        if let Some(manager) = self.manager.upgrade() {
            if let Err(e) = update(&manager) {
                warn!(user = %self.identity, error = %e, "cannot persist user metadata");
            }
        }
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("identity", &self.identity)
            .field("server_url", &self.server_url)
            .field("token_type", &self.token_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{SessionHandle, SessionState};
    use crate::transport::MockTransportFactory;

    fn setup() -> (Arc<SyncManager>, Arc<User>) {
        let manager = SyncManager::new(MockTransportFactory::new());
        let user = manager
            .get_user("bob", "refresh", "https://auth.example.com")
            .unwrap();
        (manager, user)
    }

    fn open(manager: &SyncManager, user: &Arc<User>, path: &str, url: &str) -> SyncResult<SessionHandle> {
        let config = SessionConfig::new(Arc::clone(user), url);
        manager.get_or_create_session(Path::new(path), config)
    }

    #[test]
    fn active_user_binds_new_sessions() {
        let (manager, user) = setup();
        let handle = open(&manager, &user, "/a", "sync://host/a").unwrap();

        assert_eq!(handle.state(), SessionState::WaitingForAccessToken);
        assert_eq!(user.all_sessions().len(), 1);
        assert!(user.waiting_sessions().is_empty());
        assert!(user.session_for_on_disk_path(Path::new("/a")).is_some());
    }

    #[test]
    fn logged_out_user_parks_sessions() {
        let (manager, user) = setup();
        user.log_out();
        let handle = open(&manager, &user, "/a", "sync://host/a").unwrap();

        assert_eq!(handle.state(), SessionState::Inactive);
        assert!(user.all_sessions().is_empty());
        assert_eq!(user.waiting_sessions().len(), 1);
    }

    #[test]
    fn log_out_parks_bound_sessions() {
        let (manager, user) = setup();
        let handle = open(&manager, &user, "/a", "sync://host/a").unwrap();
        handle.refresh_access_token("access", Some("sync://host/a"));

        user.log_out();
        assert_eq!(user.state(), UserState::LoggedOut);
        assert_eq!(handle.state(), SessionState::Inactive);
        assert_eq!(user.waiting_sessions().len(), 1);
        assert!(user.all_sessions().is_empty());

        // Logging out again changes nothing.
        user.log_out();
        assert_eq!(user.state(), UserState::LoggedOut);
        assert_eq!(user.waiting_sessions().len(), 1);
    }

    #[test]
    fn login_revives_waiting_sessions() {
        let (manager, user) = setup();
        user.log_out();
        let a = open(&manager, &user, "/a", "sync://host/a").unwrap();
        let b = open(&manager, &user, "/b", "sync://host/b").unwrap();

        user.update_refresh_token("new");
        assert_eq!(user.state(), UserState::Active);
        assert_eq!(user.refresh_token(), "new");
        assert_eq!(a.state(), SessionState::WaitingForAccessToken);
        assert_eq!(b.state(), SessionState::WaitingForAccessToken);
        assert_eq!(user.all_sessions().len(), 2);
        assert!(user.waiting_sessions().is_empty());
    }

    #[test]
    fn duplicate_default_path_rejected() {
        let (manager, user) = setup();
        let _first = open(&manager, &user, "/a", "sync://host/same").unwrap();
        let second = open(&manager, &user, "/b", "sync://host/same");

        assert!(matches!(
            second,
            Err(SyncError::DuplicateDefaultSession { .. })
        ));
        assert!(manager.get_existing_session(Path::new("/b")).is_none());
    }

    #[test]
    fn custom_paths_may_share_url() {
        let (manager, user) = setup();
        let config = |name: &str| {
            SessionConfig::new(Arc::clone(&user), "sync://host/same").with_custom_file_name(name)
        };
        let _a = manager
            .get_or_create_session(Path::new("/a"), config("a"))
            .unwrap();
        let _b = manager
            .get_or_create_session(Path::new("/b"), config("b"))
            .unwrap();
        assert_eq!(user.all_sessions().len(), 2);
    }

    #[test]
    fn invalidated_user_drops_registrations() {
        let (manager, user) = setup();
        user.invalidate();
        let handle = open(&manager, &user, "/a", "sync://host/a").unwrap();

        assert_eq!(handle.state(), SessionState::Inactive);
        assert!(user.all_sessions().is_empty());
        assert!(user.waiting_sessions().is_empty());

        user.update_refresh_token("ignored");
        assert_eq!(user.state(), UserState::Error);
        assert_eq!(user.refresh_token(), "refresh");
    }

    #[test]
    fn admin_user_binds_immediately() {
        let manager = SyncManager::new(MockTransportFactory::new());
        let admin = manager.get_admin_token_user("https://server.example.com", "admin-token");
        let handle = open(&manager, &admin, "/a", "sync://host/a").unwrap();

        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(handle.server_url().as_deref(), Some("sync://host/a"));

        admin.log_out();
        assert_eq!(admin.state(), UserState::Active);
        assert_eq!(handle.state(), SessionState::Active);
    }

    #[test]
    fn dead_sessions_are_pruned() {
        let (manager, user) = setup();
        let handle = open(&manager, &user, "/a", "sync://host/a").unwrap();
        handle.log_out();
        drop(handle);

        assert!(user.all_sessions().is_empty());
        assert!(manager.get_existing_session(Path::new("/a")).is_none());
    }
}
