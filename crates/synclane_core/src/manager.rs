//! The session registry.
//!
//! [`SyncManager`] maps local paths to sessions, keeps the list of users,
//! owns the shared [`SyncClient`] and the on-disk layout, and runs pending
//! file actions at startup.
//!
//! It guards its state with four independent locks: the client lifecycle,
//! the session map, the user list and the file system. Sessions call back
//! into the registry only after releasing their own lock, and the registry
//! never holds the session map lock while calling anything that can re-enter
//! it.

use crate::client::SyncClient;
use crate::config::{ClientConfig, LogLevel, MetadataMode, ReconnectMode, SessionConfig, Timeouts};
use crate::crypto::EncryptionKey;
use crate::error::{SyncError, SyncResult};
use crate::file_manager::{FileActionReport, FileManager};
use crate::metadata::{FileMetadataStore, MetadataStore};
use crate::session::{Session, SessionHandle, SessionState};
use crate::transport::TransportFactory;
use crate::user::{TokenType, User, UserState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle of the shared client. Settings can change only while
/// configuring; the first session moves the registry to running.
enum ClientLifecycle {
    Configuring(ClientConfig),
    Running(Arc<SyncClient>),
}

struct FileSystem {
    files: FileManager,
    metadata: Option<Arc<dyn MetadataStore>>,
}

/// The process-wide session registry.
pub struct SyncManager {
    weak_self: Weak<SyncManager>,
    factory: Arc<dyn TransportFactory>,
    client: Mutex<ClientLifecycle>,
    sessions: Mutex<HashMap<PathBuf, Arc<Session>>>,
    users: Mutex<Vec<Arc<User>>>,
    file_system: Mutex<Option<FileSystem>>,
    metadata_key: Mutex<Option<EncryptionKey>>,
}

impl SyncManager {
    /// Creates a registry whose sessions get transports from `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Self::with_config(factory, ClientConfig::default())
    }

    /// Creates a registry with an initial client configuration.
    pub fn with_config(factory: Arc<dyn TransportFactory>, config: ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            factory,
            client: Mutex::new(ClientLifecycle::Configuring(config)),
            sessions: Mutex::new(HashMap::new()),
            users: Mutex::new(Vec::new()),
            file_system: Mutex::new(None),
            metadata_key: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Client configuration
    // ------------------------------------------------------------------

    fn configure(
        &self,
        setting: &'static str,
        update: impl FnOnce(&mut ClientConfig),
    ) -> SyncResult<()> {
        match &mut *self.client.lock() {
            ClientLifecycle::Configuring(config) => {
                update(config);
                Ok(())
            }
            ClientLifecycle::Running(_) => Err(SyncError::configuration_locked(setting)),
        }
    }

    /// Sets the client log level.
    pub fn set_log_level(&self, level: LogLevel) -> SyncResult<()> {
        self.configure("log level", |config| config.log_level = level)
    }

    /// Sets the connection timeouts.
    pub fn set_timeouts(&self, timeouts: Timeouts) -> SyncResult<()> {
        self.configure("timeouts", |config| config.timeouts = timeouts)
    }

    /// Enables or disables session multiplexing.
    pub fn enable_session_multiplexing(&self, enabled: bool) -> SyncResult<()> {
        self.configure("session multiplexing", |config| {
            config.multiplex_sessions = enabled;
        })
    }

    /// Sets the binding and application parts of the user agent.
    pub fn set_user_agent(&self, binding_info: &str, application_info: &str) -> SyncResult<()> {
        self.configure("user agent", |config| {
            config.user_agent_binding_info = binding_info.to_string();
            config.user_agent_application_info = application_info.to_string();
        })
    }

    /// Sets the reconnect mode.
    pub fn set_client_reconnect_mode(&self, mode: ReconnectMode) -> SyncResult<()> {
        self.configure("reconnect mode", |config| config.reconnect_mode = mode)
    }

    /// Sets the key used when the metadata store is opened without an
    /// explicit key.
    pub fn set_metadata_encryption_key(&self, key: EncryptionKey) -> SyncResult<()> {
        if self.file_system.lock().is_some() {
            return Err(SyncError::configuration_locked("metadata encryption key"));
        }
        *self.metadata_key.lock() = Some(key);
        Ok(())
    }

    /// Returns the shared client, starting it on first use.
    pub fn client(&self) -> SyncResult<Arc<SyncClient>> {
        let mut lifecycle = self.client.lock();
        match &*lifecycle {
            ClientLifecycle::Running(client) => Ok(Arc::clone(client)),
            ClientLifecycle::Configuring(config) => {
                let client = Arc::new(SyncClient::start(config.clone())?);
                *lifecycle = ClientLifecycle::Running(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    /// Returns true once the shared client exists.
    pub fn is_client_running(&self) -> bool {
        matches!(&*self.client.lock(), ClientLifecycle::Running(_))
    }

    /// Blocks until the shared client has run all queued work.
    pub fn flush_client(&self) {
        let client = match &*self.client.lock() {
            ClientLifecycle::Running(client) => Arc::clone(client),
            ClientLifecycle::Configuring(_) => return,
        };
        client.flush();
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.factory
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Returns the session for `path`, creating it if needed, and registers
    /// it with the user named in `config`.
    ///
    /// # Errors
    ///
    /// Fails if the client cannot be started or if the user already has a
    /// default-path session for the same URL elsewhere.
    pub fn get_or_create_session(
        &self,
        path: &Path,
        config: SessionConfig,
    ) -> SyncResult<SessionHandle> {
        self.client()?;

        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get(path) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let session =
                        Session::new(path.to_path_buf(), config, self.weak_self.clone());
                    sessions.insert(path.to_path_buf(), Arc::clone(&session));
                    debug!(path = %path.display(), "session created");
                    session
                }
            }
        };

        // Taken before registration so that a failure below closes the
        // session when the handle drops.
        let handle = session.external_reference();
        session.user().register_session(&session)?;
        Ok(handle)
    }

    /// Returns the session for `path` if one exists.
    pub fn get_existing_session(&self, path: &Path) -> Option<SessionHandle> {
        let session = self.sessions.lock().get(path).cloned()?;
        Some(session.external_reference())
    }

    /// Returns the session for `path` only if a caller already holds it.
    pub fn get_existing_active_session(&self, path: &Path) -> Option<SessionHandle> {
        let session = self.sessions.lock().get(path).cloned()?;
        session.existing_external_reference()
    }

    /// Returns true if a caller holds any session.
    pub fn has_existing_sessions(&self) -> bool {
        self.sessions
            .lock()
            .values()
            .any(|session| session.has_external_reference())
    }

    /// Forgets the session for `path` if no caller holds it and it is
    /// inactive or failed.
    pub(crate) fn unregister(&self, path: &Path) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removable = sessions.get(path).is_some_and(|session| {
                !session.has_external_reference()
                    && matches!(
                        session.state(),
                        SessionState::Inactive | SessionState::Error
                    )
            });
            if removable {
                sessions.remove(path)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(path = %path.display(), "session unregistered");
        }
    }

    /// Asks every session to reconnect without delay.
    pub fn reconnect(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.handle_reconnect();
        }
    }

    /// Discards all state: users, sessions, the client and the file system
    /// configuration.
    ///
    /// # Panics
    ///
    /// Panics if a caller still holds a session.
    pub fn reset_for_testing(&self) {
        {
            let sessions = self.sessions.lock();
            assert!(
                !sessions.values().any(|s| s.has_external_reference()),
                "reset_for_testing called while sessions are in use"
            );
        }

        let users = std::mem::take(&mut *self.users.lock());
        let lifecycle = std::mem::replace(
            &mut *self.client.lock(),
            ClientLifecycle::Configuring(ClientConfig::default()),
        );
        if let ClientLifecycle::Running(client) = lifecycle {
            client.stop();
        }
        let sessions = std::mem::take(&mut *self.sessions.lock());
        let file_system = self.file_system.lock().take();
        self.metadata_key.lock().take();

        debug!(
            users = users.len(),
            sessions = sessions.len(),
            "registry reset"
        );
        drop(sessions);
        drop(users);
        drop(file_system);
    }

    // ------------------------------------------------------------------
    // File system and metadata
    // ------------------------------------------------------------------

    /// Sets up the on-disk layout and metadata store under `base_path`.
    ///
    /// Loads persisted logged-in users, deletes the data of users marked for
    /// removal and runs pending file actions. Only the first call has an
    /// effect.
    pub fn configure_file_system(&self, base_path: &Path, mode: MetadataMode) -> SyncResult<()> {
        let metadata = {
            let mut file_system = self.file_system.lock();
            if file_system.is_some() {
                return Ok(());
            }
            let files = FileManager::new(base_path)?;
            let metadata: Option<Arc<dyn MetadataStore>> = match mode {
                MetadataMode::NoMetadata => None,
                MetadataMode::NoEncryption => {
                    let key = self.metadata_key.lock().clone();
                    Some(Arc::new(FileMetadataStore::open(
                        &files.metadata_path()?,
                        key.as_ref(),
                    )?))
                }
                MetadataMode::Encryption(key) => Some(Arc::new(FileMetadataStore::open(
                    &files.metadata_path()?,
                    Some(&key),
                )?)),
            };
            *file_system = Some(FileSystem {
                files,
                metadata: metadata.clone(),
            });
            metadata
        };
        info!(base = %base_path.display(), metadata = metadata.is_some(), "file system configured");

        let Some(store) = metadata else {
            return Ok(());
        };

        let records = store.all_unmarked_users()?;
        {
            let mut users = self.users.lock();
            for record in records {
                let Some(token) = record.user_token else {
                    continue;
                };
                if users.iter().any(|u| u.identity() == record.identity) {
                    continue;
                }
                users.push(User::new(
                    &record.identity,
                    &token,
                    &record.server_url,
                    &record.local_uuid,
                    TokenType::Normal,
                    self.weak_self.clone(),
                ));
            }
            debug!(users = users.len(), "loaded persisted users");
        }

        self.purge_removed_users()?;
        self.run_pending_file_actions()?;
        Ok(())
    }

    /// Like [`configure_file_system`](Self::configure_file_system) but with a
    /// caller-supplied metadata store.
    pub fn configure_file_system_with_store(
        &self,
        base_path: &Path,
        store: Arc<dyn MetadataStore>,
    ) -> SyncResult<()> {
        {
            let mut file_system = self.file_system.lock();
            if file_system.is_some() {
                return Ok(());
            }
            *file_system = Some(FileSystem {
                files: FileManager::new(base_path)?,
                metadata: Some(store),
            });
        }
        self.purge_removed_users()?;
        self.run_pending_file_actions()?;
        Ok(())
    }

    fn file_system_parts(&self) -> Option<(FileManager, Option<Arc<dyn MetadataStore>>)> {
        self.file_system
            .lock()
            .as_ref()
            .map(|fs| (fs.files.clone(), fs.metadata.clone()))
    }

    /// Returns the metadata store, if one is configured.
    pub fn metadata_store(&self) -> Option<Arc<dyn MetadataStore>> {
        self.file_system_parts().and_then(|(_, store)| store)
    }

    /// Runs `update` against the metadata store. Returns `false` without
    /// running it if no store is configured.
    pub fn perform_metadata_update<F>(&self, update: F) -> SyncResult<bool>
    where
        F: FnOnce(&dyn MetadataStore) -> SyncResult<()>,
    {
        match self.metadata_store() {
            Some(store) => {
                update(store.as_ref())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes the directories and records of users marked for removal.
    /// Returns how many users were purged.
    pub fn purge_removed_users(&self) -> SyncResult<usize> {
        match self.file_system_parts() {
            Some((files, Some(store))) => files.purge_removed_users(store.as_ref()),
            _ => Ok(0),
        }
    }

    /// Runs every pending file action. Completed actions are removed from
    /// the metadata store; failed ones stay for the next sweep.
    pub fn run_pending_file_actions(&self) -> SyncResult<FileActionReport> {
        match self.file_system_parts() {
            Some((files, Some(store))) => files.run_pending_file_actions(store.as_ref()),
            _ => Ok(FileActionReport::default()),
        }
    }

    /// Runs the pending file action for `path`, if any. Returns whether an
    /// action ran to completion.
    pub fn immediately_run_file_actions(&self, path: &Path) -> SyncResult<bool> {
        let Some((files, Some(store))) = self.file_system_parts() else {
            return Ok(false);
        };
        let Some(record) = store.file_action_for(path)? else {
            return Ok(false);
        };
        if files.run_file_action(&record) {
            store.remove_file_action(path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Returns the default path of the file `user` synchronizes with `url`.
    pub fn path_for_realm(&self, user: &User, url: &str) -> SyncResult<PathBuf> {
        let (files, _) = self
            .file_system_parts()
            .ok_or(SyncError::MetadataUnavailable)?;
        files.path_for_realm(user.local_identity(), url)
    }

    /// Returns the path of a file with a host-chosen name.
    pub fn path_for_file(&self, user: &User, file_name: &str) -> SyncResult<PathBuf> {
        let (files, _) = self
            .file_system_parts()
            .ok_or(SyncError::MetadataUnavailable)?;
        files.path_for_file(user.local_identity(), file_name)
    }

    /// Returns the directory receiving recovery copies, or `None` before the
    /// file system is configured.
    pub fn recovery_directory_path(&self) -> SyncResult<Option<PathBuf>> {
        match self.file_system_parts() {
            Some((files, _)) => files.recovery_directory_path().map(Some),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Returns the user with `identity`, creating it if needed, and stores
    /// `refresh_token`. A logged-out user is logged back in.
    ///
    /// # Errors
    ///
    /// Fails if the user has been invalidated or was created with a
    /// different auth server.
    pub fn get_user(
        &self,
        identity: &str,
        refresh_token: &str,
        auth_server_url: &str,
    ) -> SyncResult<Arc<User>> {
        let mut users = self.users.lock();
        let existing = users
            .iter()
            .find(|u| !u.is_admin() && u.identity() == identity)
            .cloned();
        if let Some(user) = existing {
            drop(users);
            match user.state() {
                UserState::Error => {
                    return Err(SyncError::UserInvalidated {
                        identity: identity.to_string(),
                    });
                }
                _ if user.server_url() != auth_server_url => {
                    return Err(SyncError::AuthServerMismatch {
                        identity: identity.to_string(),
                        existing: user.server_url().to_string(),
                        requested: auth_server_url.to_string(),
                    });
                }
                UserState::LoggedOut | UserState::Active => {}
            }
            user.update_refresh_token(refresh_token);
            return Ok(user);
        }

        let local_identity = match self.metadata_store() {
            Some(store) => store.get_or_create_user(identity, auth_server_url)?.local_uuid,
            None => Uuid::new_v4().to_string(),
        };
        let user = User::new(
            identity,
            refresh_token,
            auth_server_url,
            &local_identity,
            TokenType::Normal,
            self.weak_self.clone(),
        );
        users.push(Arc::clone(&user));
        drop(users);

        self.perform_metadata_update(|store| {
            store.set_user_token(identity, auth_server_url, Some(refresh_token))
        })?;
        info!(user = %identity, "user created");
        Ok(user)
    }

    /// Returns the administrator user for `identity`, creating it with
    /// `token` if needed. Administrators are never persisted.
    pub fn get_admin_token_user(&self, identity: &str, token: &str) -> Arc<User> {
        let mut users = self.users.lock();
        if let Some(user) = users
            .iter()
            .find(|u| u.is_admin() && u.identity() == identity)
        {
            return Arc::clone(user);
        }
        let user = User::new(
            identity,
            token,
            identity,
            &format!("__admin-{}", Uuid::new_v4()),
            TokenType::Admin,
            self.weak_self.clone(),
        );
        users.push(Arc::clone(&user));
        user
    }

    /// Returns the logged-in user with `identity`.
    pub fn get_existing_logged_in_user(&self, identity: &str) -> Option<Arc<User>> {
        self.users
            .lock()
            .iter()
            .find(|u| {
                !u.is_admin() && u.identity() == identity && u.state() == UserState::Active
            })
            .cloned()
    }

    /// Returns every logged-in, non-administrator user.
    pub fn all_logged_in_users(&self) -> Vec<Arc<User>> {
        self.users
            .lock()
            .iter()
            .filter(|u| !u.is_admin() && u.state() == UserState::Active)
            .cloned()
            .collect()
    }

    /// Returns the only logged-in user, if there is exactly one.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MultipleUsersLoggedIn`] if more than one user is
    /// logged in.
    pub fn get_current_user(&self) -> SyncResult<Option<Arc<User>>> {
        let mut users = self.all_logged_in_users();
        match users.len() {
            0 => Ok(None),
            1 => Ok(users.pop()),
            count => Err(SyncError::MultipleUsersLoggedIn { count }),
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("client_running", &self.is_client_running())
            .field("sessions", &self.sessions.lock().len())
            .field("users", &self.users.lock().len())
            .finish()
    }
}
