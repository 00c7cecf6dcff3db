//! Configuration for the sync client and for individual sessions.

use crate::crypto::EncryptionKey;
use crate::protocol::SessionError;
use crate::session::Session;
use crate::user::User;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Callback asking the host application for an access token.
///
/// Invoked with the session's on-disk path, its configuration and the
/// session itself. The host is expected to eventually call
/// [`Session::refresh_access_token`] on the passed session.
pub type BindSessionHandler = Arc<dyn Fn(&Path, &SessionConfig, Arc<Session>) + Send + Sync>;

/// Callback receiving errors that the session layer surfaces to the host.
pub type ErrorHandler = Arc<dyn Fn(Arc<Session>, SessionError) + Send + Sync>;

/// What a session does when it is closed while bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    /// Tear the connection down at once.
    Immediately,
    /// Keep the session alive for the lifetime of the process.
    LiveIndefinitely,
    /// Drain pending uploads, then tear down.
    #[default]
    AfterChangesUploaded,
}

/// Process-wide log level of the sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Everything.
    All,
    /// Trace output.
    Trace,
    /// Debug output.
    Debug,
    /// Detailed informational output.
    Detail,
    /// Informational output.
    #[default]
    Info,
    /// Warnings.
    Warn,
    /// Errors.
    Error,
    /// Unrecoverable errors only.
    Fatal,
    /// Nothing.
    Off,
}

impl LogLevel {
    /// Returns the `EnvFilter` directive for this level.
    #[must_use]
    pub const fn as_directive(self) -> &'static str {
        match self {
            LogLevel::All | LogLevel::Trace => "trace",
            LogLevel::Debug | LogLevel::Detail => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
            LogLevel::Off => "off",
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::All | LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug | LogLevel::Detail => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// How the client schedules reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Exponential backoff between attempts.
    #[default]
    Normal,
    /// Reconnect without delay; only for tests.
    Testing,
}

/// Connection timeouts handed to every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// How long an idle connection stays open after its last session closes.
    pub connection_linger_time: Duration,
    /// Interval between keepalive pings.
    pub ping_keepalive_period: Duration,
    /// Time allowed for a pong to arrive.
    pub pong_keepalive_timeout: Duration,
    /// Window within which a reconnect counts as "fast".
    pub fast_reconnect_limit: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(120),
            connection_linger_time: Duration::from_secs(30),
            ping_keepalive_period: Duration::from_secs(60),
            pong_keepalive_timeout: Duration::from_secs(120),
            fast_reconnect_limit: Duration::from_secs(60),
        }
    }
}

/// Settings captured by the sync client when it is created.
///
/// Once the client exists these are fixed; the registry rejects further
/// changes with [`SyncError::ConfigurationLocked`](crate::SyncError::ConfigurationLocked).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Process-wide log level.
    pub log_level: LogLevel,
    /// Connection timeouts.
    pub timeouts: Timeouts,
    /// Whether sessions to the same server share one connection.
    pub multiplex_sessions: bool,
    /// Identifies the language binding in the user agent.
    pub user_agent_binding_info: String,
    /// Identifies the host application in the user agent.
    pub user_agent_application_info: String,
    /// Reconnect scheduling.
    pub reconnect_mode: ReconnectMode,
}

impl ClientConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log level.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the connection timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enables or disables session multiplexing.
    #[must_use]
    pub fn with_multiplexing(mut self, enabled: bool) -> Self {
        self.multiplex_sessions = enabled;
        self
    }

    /// Sets the application part of the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, application_info: impl Into<String>) -> Self {
        self.user_agent_application_info = application_info.into();
        self
    }

    /// Returns the full user agent string sent to the server.
    #[must_use]
    pub fn user_agent(&self) -> String {
        let mut agent = format!("synclane/{}", env!("CARGO_PKG_VERSION"));
        for part in [
            &self.user_agent_binding_info,
            &self.user_agent_application_info,
        ] {
            if !part.is_empty() {
                agent.push(' ');
                agent.push_str(part);
            }
        }
        agent
    }
}

/// How users and pending file actions are persisted.
#[derive(Debug, Clone, Default)]
pub enum MetadataMode {
    /// Plain metadata file.
    #[default]
    NoEncryption,
    /// Metadata file encrypted with the given key.
    Encryption(EncryptionKey),
    /// Keep nothing on disk.
    NoMetadata,
}

/// Configuration of a single session.
#[derive(Clone)]
pub struct SessionConfig {
    /// User that owns the session.
    pub user: Arc<User>,
    /// Remote URL of the synchronized file.
    pub realm_url: String,
    /// What to do when the session is closed while bound.
    pub stop_policy: StopPolicy,
    /// Asks the host for an access token.
    pub bind_session_handler: Option<BindSessionHandler>,
    /// Receives surfaced errors.
    pub error_handler: Option<ErrorHandler>,
    /// File name chosen by the host; `None` means the default per-URL path.
    pub custom_file_name: Option<String>,
    /// Whether the transport validates server certificates.
    pub client_validate_ssl: bool,
}

impl SessionConfig {
    /// Creates a configuration for `realm_url` owned by `user`.
    pub fn new(user: Arc<User>, realm_url: impl Into<String>) -> Self {
        Self {
            user,
            realm_url: realm_url.into(),
            stop_policy: StopPolicy::default(),
            bind_session_handler: None,
            error_handler: None,
            custom_file_name: None,
            client_validate_ssl: true,
        }
    }

    /// Sets the stop policy.
    #[must_use]
    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Sets the bind callback.
    #[must_use]
    pub fn with_bind_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Path, &SessionConfig, Arc<Session>) + Send + Sync + 'static,
    {
        self.bind_session_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the error callback.
    #[must_use]
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Session>, SessionError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Uses a host-chosen file name instead of the default per-URL path.
    #[must_use]
    pub fn with_custom_file_name(mut self, name: impl Into<String>) -> Self {
        self.custom_file_name = Some(name.into());
        self
    }

    /// Sets whether server certificates are validated.
    #[must_use]
    pub fn with_ssl_validation(mut self, validate: bool) -> Self {
        self.client_validate_ssl = validate;
        self
    }

    /// Returns true if the session lives at the default per-URL path.
    #[must_use]
    pub fn uses_default_path(&self) -> bool {
        self.custom_file_name.is_none()
    }

    /// Drops the callbacks and resets the stop policy. Used once a session
    /// has failed for good.
    pub(crate) fn clear(&mut self) {
        self.bind_session_handler = None;
        self.error_handler = None;
        self.stop_policy = StopPolicy::Immediately;
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("user", &self.user.identity())
            .field("realm_url", &self.realm_url)
            .field("stop_policy", &self.stop_policy)
            .field("has_bind_handler", &self.bind_session_handler.is_some())
            .field("has_error_handler", &self.error_handler.is_some())
            .field("custom_file_name", &self.custom_file_name)
            .field("client_validate_ssl", &self.client_validate_ssl)
            .finish()
    }
}
