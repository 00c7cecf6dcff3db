//! Test fixtures.
//!
//! [`TestEnv`] owns a temporary directory, a registry wired to the mock
//! transport and a [`CallbackLog`] recording every bind and error callback.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use synclane_core::{
    MemoryMetadataStore, MockTransport, MockTransportFactory, Session, SessionConfig,
    SessionError, SessionErrorKind, SessionHandle, SessionState, StopPolicy, SyncManager, User,
};
use tempfile::TempDir;

/// Auth server URL used by fixture users.
pub const AUTH_URL: &str = "https://auth.test.invalid";

/// Remote URL used by fixture sessions.
pub const REALM_URL: &str = "sync://sync.test.invalid/shared";

/// Access token supplied by [`TestEnv::open_active`].
pub const ACCESS_TOKEN: &str = "access-token";

/// Records the callbacks sessions invoke.
#[derive(Debug, Default)]
pub struct CallbackLog {
    binds: Mutex<Vec<PathBuf>>,
    errors: Mutex<Vec<(PathBuf, SessionError)>>,
}

impl CallbackLog {
    /// Creates an empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a bind callback that records the session path.
    pub fn bind_handler(
        self: &Arc<Self>,
    ) -> impl Fn(&Path, &SessionConfig, Arc<Session>) + Send + Sync + 'static {
        let log = Arc::clone(self);
        move |path: &Path, _config: &SessionConfig, _session: Arc<Session>| {
            log.binds.lock().push(path.to_path_buf());
        }
    }

    /// Returns an error callback that records the error.
    pub fn error_handler(self: &Arc<Self>) -> impl Fn(Arc<Session>, SessionError) + Send + Sync + 'static {
        let log = Arc::clone(self);
        move |session: Arc<Session>, error: SessionError| {
            log.errors.lock().push((session.path().to_path_buf(), error));
        }
    }

    /// Number of bind callbacks so far.
    pub fn bind_count(&self) -> usize {
        self.binds.lock().len()
    }

    /// Number of bind callbacks for `path`.
    pub fn binds_for(&self, path: &Path) -> usize {
        self.binds.lock().iter().filter(|p| p.as_path() == path).count()
    }

    /// Every reported error.
    pub fn errors(&self) -> Vec<(PathBuf, SessionError)> {
        self.errors.lock().clone()
    }

    /// Kinds of the reported errors, in order.
    pub fn error_kinds(&self) -> Vec<SessionErrorKind> {
        self.errors.lock().iter().map(|(_, e)| e.kind).collect()
    }
}

/// A registry with a temporary directory and recording callbacks.
pub struct TestEnv {
    /// The registry under test.
    pub manager: Arc<SyncManager>,
    /// Factory recording every transport the registry creates.
    pub factory: Arc<MockTransportFactory>,
    /// Metadata store backing the registry.
    pub store: Arc<MemoryMetadataStore>,
    /// Callbacks invoked by fixture sessions.
    pub callbacks: Arc<CallbackLog>,
    temp_dir: TempDir,
}

impl TestEnv {
    /// Creates a registry with a configured file system and an in-memory
    /// metadata store.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let factory = MockTransportFactory::new();
        let manager = SyncManager::new(factory.clone());
        let store = Arc::new(MemoryMetadataStore::new());
        manager
            .configure_file_system_with_store(temp_dir.path(), store.clone())
            .expect("Failed to configure file system");
        Self {
            manager,
            factory,
            store,
            callbacks: CallbackLog::new(),
            temp_dir,
        }
    }

    /// Returns the temporary base directory.
    pub fn base_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Returns the path fixture sessions named `name` live at.
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(format!("{name}.realm"))
    }

    /// Returns the logged-in user `identity`.
    pub fn user(&self, identity: &str) -> Arc<User> {
        self.manager
            .get_user(identity, &format!("refresh-{identity}"), AUTH_URL)
            .expect("Failed to get user")
    }

    /// Builds a session configuration with the recording callbacks and a
    /// custom file name.
    pub fn config(&self, user: &Arc<User>, name: &str, policy: StopPolicy) -> SessionConfig {
        SessionConfig::new(Arc::clone(user), REALM_URL)
            .with_custom_file_name(name)
            .with_stop_policy(policy)
            .with_bind_handler(self.callbacks.bind_handler())
            .with_error_handler(self.callbacks.error_handler())
    }

    /// Opens the session `name` without supplying a token.
    pub fn open(&self, user: &Arc<User>, name: &str, policy: StopPolicy) -> SessionHandle {
        self.manager
            .get_or_create_session(&self.path(name), self.config(user, name, policy))
            .expect("Failed to open session")
    }

    /// Opens the session `name` and binds it.
    pub fn open_active(
        &self,
        user: &Arc<User>,
        name: &str,
        policy: StopPolicy,
    ) -> (SessionHandle, Arc<MockTransport>) {
        let handle = self.open(user, name, policy);
        handle.refresh_access_token(ACCESS_TOKEN, Some(REALM_URL));
        assert_eq!(handle.state(), SessionState::Active, "session did not bind");
        let transport = self.transport(name);
        (handle, transport)
    }

    /// Returns the newest transport created for the session `name`.
    pub fn transport(&self, name: &str) -> Arc<MockTransport> {
        self.factory
            .latest(&self.path(name))
            .expect("No transport for session")
    }

    /// Waits until the client has delivered every posted callback.
    pub fn flush(&self) {
        self.manager.flush_client();
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
