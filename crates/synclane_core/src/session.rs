//! The session state machine.
//!
//! A [`Session`] coordinates one local file with the sync server. It owns a
//! transport while it is connecting, connected or draining uploads, and
//! dispatches every public operation through its current state:
//!
//! ```text
//!              revive / bind_with_admin_token
//!   Inactive ─────────────────────────────────▶ WaitingForAccessToken
//!      ▲  ▲                                        │   ▲
//!      │  │ log_out / close(Immediately)           │   │ token expired
//!      │  └────────────────────────────────────────┤   │
//!      │                            refresh token  ▼   │
//!      │  uploads drained                         Active
//!      └──────────── Dying ◀──────────────────────┘ ▲
//!                      │   close(AfterChangesUploaded)
//!                      └─────────── revive ─────────┘
//!
//!   any state ── fatal error ──▶ Error (terminal)
//! ```
//!
//! Every operation mutates state under the session lock, collects the
//! callbacks and cross-component calls it implies, releases the lock and only
//! then performs them.

use crate::config::{BindSessionHandler, ErrorHandler, SessionConfig, StopPolicy};
use crate::error::SyncResult;
use crate::manager::SyncManager;
use crate::metadata::FileActionRecord;
use crate::protocol::{self, ErrorAction, SessionError, SessionErrorKind, TransportErrorEvent};
use crate::transport::{CompletionHandler, SessionTransport, SyncTransactCallback, TransportError};
use crate::user::User;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Public state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport; the session is idle.
    Inactive,
    /// A transport exists and the host has been asked for an access token.
    WaitingForAccessToken,
    /// Bound and synchronizing.
    Active,
    /// Closed while bound; waiting for uploads to drain.
    Dying,
    /// Failed for good. Every operation is a no-op.
    Error,
}

impl SessionState {
    /// Returns true for the states that own a transport.
    #[must_use]
    pub const fn has_transport(self) -> bool {
        matches!(
            self,
            SessionState::WaitingForAccessToken | SessionState::Active | SessionState::Dying
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Inactive => "inactive",
            SessionState::WaitingForAccessToken => "waiting_for_access_token",
            SessionState::Active => "active",
            SessionState::Dying => "dying",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

struct Connection {
    transport: Arc<dyn SessionTransport>,
    /// Whether `bind` has been called on the transport.
    bound: bool,
}

enum Phase {
    Inactive,
    WaitingForAccessToken {
        conn: Connection,
        deferred_close: bool,
    },
    Active {
        conn: Connection,
    },
    Dying {
        conn: Connection,
    },
    Error,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Inactive => SessionState::Inactive,
            Phase::WaitingForAccessToken { .. } => SessionState::WaitingForAccessToken,
            Phase::Active { .. } => SessionState::Active,
            Phase::Dying { .. } => SessionState::Dying,
            Phase::Error => SessionState::Error,
        }
    }

    fn transport(&self) -> Option<&Arc<dyn SessionTransport>> {
        match self {
            Phase::WaitingForAccessToken { conn, .. }
            | Phase::Active { conn }
            | Phase::Dying { conn } => Some(&conn.transport),
            Phase::Inactive | Phase::Error => None,
        }
    }
}

struct Inner {
    phase: Phase,
    config: SessionConfig,
    server_url: Option<String>,
    /// Commit version to report once bound.
    pending_version: Option<u64>,
    death_count: u64,
    /// Waits requested before the transport was bound.
    queued_uploads: Vec<CompletionHandler>,
    queued_downloads: Vec<CompletionHandler>,
}

/// Work performed after the session lock is released.
enum Followup {
    CloseTransport(Arc<dyn SessionTransport>),
    Unregister,
    RequestAccessToken(BindSessionHandler, SessionConfig),
    DrainUploads {
        transport: Arc<dyn SessionTransport>,
        death_count: u64,
    },
    RegisterWaits {
        transport: Arc<dyn SessionTransport>,
        uploads: Vec<CompletionHandler>,
        downloads: Vec<CompletionHandler>,
    },
    AbortWaits(Vec<CompletionHandler>),
    InvalidateUser(Arc<User>),
    RecordFileAction(FileActionRecord),
    ReportError(ErrorHandler, SessionError),
}

/// A synchronized local file.
pub struct Session {
    path: PathBuf,
    weak_self: Weak<Session>,
    manager: Weak<SyncManager>,
    inner: Mutex<Inner>,
    external: Mutex<Weak<ExternalReference>>,
    transact_callback: Mutex<Option<SyncTransactCallback>>,
}

impl Session {
    pub(crate) fn new(path: PathBuf, config: SessionConfig, manager: Weak<SyncManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            path,
            weak_self: weak_self.clone(),
            manager,
            inner: Mutex::new(Inner {
                phase: Phase::Inactive,
                config,
                server_url: None,
                pending_version: None,
                death_count: 0,
                queued_uploads: Vec::new(),
                queued_downloads: Vec::new(),
            }),
            external: Mutex::new(Weak::new()),
            transact_callback: Mutex::new(None),
        })
    }

    /// Returns the local file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().phase.state()
    }

    /// Returns true if the session has failed for good.
    pub fn is_in_error_state(&self) -> bool {
        self.state() == SessionState::Error
    }

    /// Returns a copy of the configuration. Callbacks are dropped once the
    /// session is in [`SessionState::Error`].
    pub fn config(&self) -> SessionConfig {
        self.inner.lock().config.clone()
    }

    /// Returns the owning user.
    pub fn user(&self) -> Arc<User> {
        Arc::clone(&self.inner.lock().config.user)
    }

    /// Returns the server URL the session is bound to, if any.
    pub fn server_url(&self) -> Option<String> {
        self.inner.lock().server_url.clone()
    }

    /// Returns true if the session currently owns a transport.
    pub fn has_transport(&self) -> bool {
        self.inner.lock().phase.transport().is_some()
    }

    /// Returns how many times the session has entered [`SessionState::Dying`].
    pub fn death_count(&self) -> u64 {
        self.inner.lock().death_count
    }

    /// Returns the commit version waiting to be reported once bound.
    pub fn pending_commit_version(&self) -> Option<u64> {
        self.inner.lock().pending_version
    }

    /// Supplies an access token.
    ///
    /// While waiting for a token this binds the transport (to `server_url`
    /// the first time) and makes the session active. While active the token
    /// is handed to the live transport. Otherwise nothing happens.
    pub fn refresh_access_token(&self, access_token: &str, server_url: Option<&str>) {
        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.refresh_locked(&mut inner, access_token, server_url, &mut followups);
        }
        self.run_followups(followups);
    }

    /// Creates a transport and binds it with `admin_token`. Only acts on an
    /// inactive session.
    pub fn bind_with_admin_token(&self, admin_token: &str, server_url: &str) {
        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            match mem::replace(&mut inner.phase, Phase::Inactive) {
                Phase::Inactive => {
                    if let Some(conn) = self.connect(&inner.config) {
                        self.enter_waiting(&mut inner, conn);
                        self.refresh_locked(&mut inner, admin_token, Some(server_url), &mut followups);
                    }
                }
                phase => inner.phase = phase,
            }
        }
        self.run_followups(followups);
    }

    /// Closes the session according to its stop policy.
    pub fn close(&self) {
        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.close_locked(&mut inner, &mut followups);
        }
        self.run_followups(followups);
    }

    /// Drops the connection at once, regardless of the stop policy.
    pub fn log_out(&self) {
        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            match mem::replace(&mut inner.phase, Phase::Inactive) {
                Phase::WaitingForAccessToken { conn, .. }
                | Phase::Active { conn }
                | Phase::Dying { conn } => {
                    self.enter_inactive(&mut inner, Some(conn), &mut followups);
                }
                phase => inner.phase = phase,
            }
        }
        self.run_followups(followups);
    }

    /// Brings a dying or inactive session back.
    ///
    /// A dying session becomes active again. An inactive one gets a fresh
    /// transport and the bind callback is invoked; the return value tells
    /// whether that happened.
    pub fn revive_if_needed(&self) -> bool {
        let mut followups = Vec::new();
        let needs_token = {
            let mut inner = self.inner.lock();
            let needs_token = self.revive_locked(&mut inner);
            if needs_token {
                if let Some(handler) = inner.config.bind_session_handler.clone() {
                    followups.push(Followup::RequestAccessToken(handler, inner.config.clone()));
                }
            }
            needs_token
        };
        self.run_followups(followups);
        needs_token
    }

    /// Reports a local commit. Held until bound while waiting for a token,
    /// forwarded while active, dropped otherwise.
    pub fn nonsync_transact_notify(&self, version: u64) {
        let mut inner = self.inner.lock();
        match &inner.phase {
            Phase::WaitingForAccessToken { .. } => inner.pending_version = Some(version),
            Phase::Active { conn } => conn.transport.nonsync_transact_notify(version),
            Phase::Inactive | Phase::Dying { .. } | Phase::Error => {}
        }
    }

    /// Skips the reconnect backoff of an active session.
    pub fn handle_reconnect(&self) {
        let inner = self.inner.lock();
        if let Phase::Active { conn } = &inner.phase {
            conn.transport.cancel_reconnect_delay();
        }
    }

    /// Calls `handler` once all local changes are uploaded.
    ///
    /// Returns `false` if the session has no transport to wait on. While
    /// waiting for a token the request is held until the session binds.
    pub fn wait_for_upload_completion<F>(&self, handler: F) -> bool
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        self.wait_for_completion(Box::new(handler), true)
    }

    /// Calls `handler` once all remote changes are downloaded.
    ///
    /// Same rules as [`wait_for_upload_completion`](Self::wait_for_upload_completion).
    pub fn wait_for_download_completion<F>(&self, handler: F) -> bool
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        self.wait_for_completion(Box::new(handler), false)
    }

    /// Blocks until uploads complete. Returns `false` at once unless the
    /// session is active or dying, or if the client stops first.
    pub fn wait_for_upload_completion_blocking(&self) -> bool {
        match self.bound_transport() {
            Some(transport) => transport.wait_for_upload_complete_or_client_stopped(),
            None => false,
        }
    }

    /// Blocks until downloads complete. Same rules as
    /// [`wait_for_upload_completion_blocking`](Self::wait_for_upload_completion_blocking).
    pub fn wait_for_download_completion_blocking(&self) -> bool {
        match self.bound_transport() {
            Some(transport) => transport.wait_for_download_complete_or_client_stopped(),
            None => false,
        }
    }

    /// Sets the callback invoked with `(old_version, new_version)` after each
    /// sync transaction.
    pub fn set_sync_transact_callback<F>(&self, callback: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        *self.transact_callback.lock() = Some(Arc::new(callback));
    }

    /// Replaces the error callback.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(Arc<Session>, SessionError) + Send + Sync + 'static,
    {
        self.inner.lock().config.error_handler = Some(Arc::new(handler));
    }

    /// Returns true while a caller holds a [`SessionHandle`].
    pub fn has_external_reference(&self) -> bool {
        self.external.lock().strong_count() > 0
    }

    /// Returns the caller handle, creating one if none is alive.
    pub(crate) fn external_reference(self: &Arc<Self>) -> SessionHandle {
        let mut external = self.external.lock();
        if let Some(reference) = external.upgrade() {
            return SessionHandle { reference };
        }
        let reference = Arc::new(ExternalReference {
            session: Arc::clone(self),
        });
        *external = Arc::downgrade(&reference);
        SessionHandle { reference }
    }

    /// Returns the caller handle if one is alive.
    pub(crate) fn existing_external_reference(&self) -> Option<SessionHandle> {
        self.external
            .lock()
            .upgrade()
            .map(|reference| SessionHandle { reference })
    }

    /// Applies a protocol error reported by the transport.
    pub(crate) fn handle_error(&self, event: TransportErrorEvent) {
        let action = protocol::classify(event.code, event.is_fatal);
        let recovery_path = match action {
            ErrorAction::FailSession { client_reset: true } => self.reserve_recovery_path(),
            _ => None,
        };

        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            if matches!(inner.phase, Phase::Error) {
                trace!(path = %self.path.display(), code = event.code, "error ignored in error state");
                return;
            }

            let error = |kind, recovery_path| SessionError {
                code: event.code,
                message: event.message.clone(),
                kind,
                recovery_path,
            };

            match action {
                ErrorAction::Ignore => {
                    trace!(path = %self.path.display(), code = event.code, "informational error");
                }
                ErrorAction::RefreshAccessToken => {
                    self.access_token_expired_locked(&mut inner, &mut followups);
                }
                ErrorAction::InvalidateUser => {
                    let handler = inner.config.error_handler.clone();
                    followups.push(Followup::InvalidateUser(Arc::clone(&inner.config.user)));
                    self.enter_error(&mut inner, &mut followups);
                    if let Some(handler) = handler {
                        followups.push(Followup::ReportError(
                            handler,
                            error(SessionErrorKind::UserFatal, None),
                        ));
                    }
                }
                ErrorAction::FailSession { .. } => {
                    let handler = inner.config.error_handler.clone();
                    if let Some(new_path) = &recovery_path {
                        followups.push(Followup::RecordFileAction(
                            FileActionRecord::back_up_then_delete(
                                self.path.clone(),
                                new_path.clone(),
                                &inner.config.realm_url,
                                inner.config.user.identity(),
                            ),
                        ));
                    }
                    self.enter_error(&mut inner, &mut followups);
                    if let Some(handler) = handler {
                        followups.push(Followup::ReportError(
                            handler,
                            error(SessionErrorKind::SessionFatal, recovery_path),
                        ));
                    }
                }
                ErrorAction::Report(kind) => {
                    if let Some(handler) = inner.config.error_handler.clone() {
                        followups.push(Followup::ReportError(handler, error(kind, None)));
                    }
                }
            }
        }
        self.run_followups(followups);
    }

    fn wait_for_completion(&self, handler: CompletionHandler, upload: bool) -> bool {
        let mut followups = Vec::new();
        let accepted = {
            let mut inner = self.inner.lock();
            match &inner.phase {
                Phase::Active { conn } | Phase::Dying { conn } => {
                    let (uploads, downloads) = if upload {
                        (vec![handler], Vec::new())
                    } else {
                        (Vec::new(), vec![handler])
                    };
                    followups.push(Followup::RegisterWaits {
                        transport: Arc::clone(&conn.transport),
                        uploads,
                        downloads,
                    });
                    true
                }
                Phase::WaitingForAccessToken { .. } => {
                    if upload {
                        inner.queued_uploads.push(handler);
                    } else {
                        inner.queued_downloads.push(handler);
                    }
                    true
                }
                Phase::Inactive | Phase::Error => false,
            }
        };
        self.run_followups(followups);
        accepted
    }

    fn bound_transport(&self) -> Option<Arc<dyn SessionTransport>> {
        match &self.inner.lock().phase {
            Phase::Active { conn } | Phase::Dying { conn } => Some(Arc::clone(&conn.transport)),
            _ => None,
        }
    }

    fn refresh_locked(
        &self,
        inner: &mut Inner,
        access_token: &str,
        server_url: Option<&str>,
        followups: &mut Vec<Followup>,
    ) {
        match mem::replace(&mut inner.phase, Phase::Inactive) {
            Phase::WaitingForAccessToken {
                mut conn,
                deferred_close,
            } => {
                if inner.server_url.is_none() {
                    inner.server_url = server_url.map(str::to_string);
                }
                let Some(url) = inner.server_url.clone() else {
                    warn!(path = %self.path.display(), "access token supplied without a server URL");
                    inner.phase = Phase::WaitingForAccessToken {
                        conn,
                        deferred_close,
                    };
                    return;
                };
                if conn.bound {
                    conn.transport.refresh(access_token);
                    conn.transport.cancel_reconnect_delay();
                } else {
                    conn.transport.bind(&url, access_token);
                    conn.bound = true;
                }
                self.enter_active(inner, conn, followups);
                if deferred_close {
                    self.close_locked(inner, followups);
                }
            }
            Phase::Active { conn } => {
                conn.transport.refresh(access_token);
                conn.transport.cancel_reconnect_delay();
                inner.phase = Phase::Active { conn };
            }
            phase => inner.phase = phase,
        }
    }

    fn close_locked(&self, inner: &mut Inner, followups: &mut Vec<Followup>) {
        let policy = inner.config.stop_policy;
        match mem::replace(&mut inner.phase, Phase::Inactive) {
            Phase::Active { conn } => match policy {
                StopPolicy::Immediately => self.enter_inactive(inner, Some(conn), followups),
                StopPolicy::LiveIndefinitely => inner.phase = Phase::Active { conn },
                StopPolicy::AfterChangesUploaded => self.enter_dying(inner, conn, followups),
            },
            Phase::WaitingForAccessToken { conn, .. } => {
                if policy == StopPolicy::Immediately {
                    self.enter_inactive(inner, Some(conn), followups);
                } else {
                    inner.phase = Phase::WaitingForAccessToken {
                        conn,
                        deferred_close: true,
                    };
                }
            }
            phase => inner.phase = phase,
        }
    }

    fn revive_locked(&self, inner: &mut Inner) -> bool {
        match mem::replace(&mut inner.phase, Phase::Inactive) {
            Phase::Dying { conn } => {
                debug!(path = %self.path.display(), "revived while draining uploads");
                inner.phase = Phase::Active { conn };
                false
            }
            Phase::Inactive => match self.connect(&inner.config) {
                Some(conn) => {
                    self.enter_waiting(inner, conn);
                    true
                }
                None => false,
            },
            Phase::WaitingForAccessToken { conn, .. } => {
                inner.phase = Phase::WaitingForAccessToken {
                    conn,
                    deferred_close: false,
                };
                false
            }
            phase => {
                inner.phase = phase;
                false
            }
        }
    }

    fn access_token_expired_locked(&self, inner: &mut Inner, followups: &mut Vec<Followup>) {
        match mem::replace(&mut inner.phase, Phase::Inactive) {
            Phase::Active { conn } => {
                debug!(path = %self.path.display(), "access token expired");
                self.enter_waiting(inner, conn);
                if let Some(handler) = inner.config.bind_session_handler.clone() {
                    followups.push(Followup::RequestAccessToken(handler, inner.config.clone()));
                }
            }
            phase => inner.phase = phase,
        }
    }

    fn enter_waiting(&self, inner: &mut Inner, conn: Connection) {
        debug!(path = %self.path.display(), "waiting for access token");
        inner.phase = Phase::WaitingForAccessToken {
            conn,
            deferred_close: false,
        };
    }

    fn enter_active(&self, inner: &mut Inner, conn: Connection, followups: &mut Vec<Followup>) {
        if let Some(version) = inner.pending_version.take() {
            conn.transport.nonsync_transact_notify(version);
        }
        let uploads = mem::take(&mut inner.queued_uploads);
        let downloads = mem::take(&mut inner.queued_downloads);
        if !uploads.is_empty() || !downloads.is_empty() {
            followups.push(Followup::RegisterWaits {
                transport: Arc::clone(&conn.transport),
                uploads,
                downloads,
            });
        }
        info!(path = %self.path.display(), "session active");
        inner.phase = Phase::Active { conn };
    }

    fn enter_dying(&self, inner: &mut Inner, conn: Connection, followups: &mut Vec<Followup>) {
        inner.death_count += 1;
        debug!(path = %self.path.display(), death_count = inner.death_count, "draining uploads");
        followups.push(Followup::DrainUploads {
            transport: Arc::clone(&conn.transport),
            death_count: inner.death_count,
        });
        inner.phase = Phase::Dying { conn };
    }

    fn enter_inactive(
        &self,
        inner: &mut Inner,
        conn: Option<Connection>,
        followups: &mut Vec<Followup>,
    ) {
        inner.phase = Phase::Inactive;
        inner.server_url = None;
        if let Some(conn) = conn {
            followups.push(Followup::CloseTransport(conn.transport));
        }
        self.abort_queued_waits(inner, followups);
        followups.push(Followup::Unregister);
        info!(path = %self.path.display(), "session inactive");
    }

    fn enter_error(&self, inner: &mut Inner, followups: &mut Vec<Followup>) {
        if let Some(transport) = inner.phase.transport() {
            followups.push(Followup::CloseTransport(Arc::clone(transport)));
        }
        inner.phase = Phase::Error;
        inner.config.clear();
        inner.pending_version = None;
        self.abort_queued_waits(inner, followups);
        followups.push(Followup::Unregister);
        warn!(path = %self.path.display(), "session failed");
    }

    fn abort_queued_waits(&self, inner: &mut Inner, followups: &mut Vec<Followup>) {
        let mut waits = mem::take(&mut inner.queued_uploads);
        waits.append(&mut inner.queued_downloads);
        if !waits.is_empty() {
            followups.push(Followup::AbortWaits(waits));
        }
    }

    fn did_drain_uploads(&self, death_count: u64) {
        let mut followups = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.death_count != death_count {
                trace!(path = %self.path.display(), "stale upload drain ignored");
                return;
            }
            match mem::replace(&mut inner.phase, Phase::Inactive) {
                Phase::Dying { conn } => self.enter_inactive(&mut inner, Some(conn), &mut followups),
                phase => inner.phase = phase,
            }
        }
        self.run_followups(followups);
    }

    fn did_drop_external_reference(&self) {
        let mut followups = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            if self.has_external_reference() {
                return;
            }
            self.close_locked(&mut inner, &mut followups);
            inner.phase.state()
        };
        self.run_followups(followups);
        if matches!(state, SessionState::Inactive | SessionState::Error) {
            if let Some(manager) = self.manager.upgrade() {
                manager.unregister(&self.path);
            }
        }
    }

    fn on_sync_transact(&self, old_version: u64, new_version: u64) {
        let callback = self.transact_callback.lock().clone();
        if let Some(callback) = callback {
            callback(old_version, new_version);
        }
    }

    /// Creates a transport wired back to this session.
    fn connect(&self, config: &SessionConfig) -> Option<Connection> {
        let manager = self.manager.upgrade()?;
        let client = match manager.client() {
            Ok(client) => client,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot start sync client");
                return None;
            }
        };
        let transport = manager
            .transport_factory()
            .make_session(&client, &self.path, config);

        let weak = self.weak_self.clone();
        transport.set_error_handler(Arc::new(move |event| {
            if let Some(session) = weak.upgrade() {
                session.handle_error(event);
            }
        }));
        let weak = self.weak_self.clone();
        transport.set_sync_transact_callback(Arc::new(move |old_version, new_version| {
            if let Some(session) = weak.upgrade() {
                session.on_sync_transact(old_version, new_version);
            }
        }));

        Some(Connection {
            transport,
            bound: false,
        })
    }

    fn reserve_recovery_path(&self) -> Option<PathBuf> {
        let manager = self.manager.upgrade()?;
        match manager.recovery_directory_path() {
            Ok(Some(dir)) => Some(dir.join(format!("recovered-{}", Uuid::new_v4()))),
            Ok(None) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "no recovery directory");
                None
            }
        }
    }

    fn record_file_action(&self, record: FileActionRecord) -> SyncResult<bool> {
        match self.manager.upgrade() {
            Some(manager) => manager.perform_metadata_update(|store| store.add_file_action(record)),
            None => Ok(false),
        }
    }

    fn run_followups(&self, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::CloseTransport(transport) => transport.close(),
                Followup::Unregister => {
                    if let Some(manager) = self.manager.upgrade() {
                        manager.unregister(&self.path);
                    }
                }
                Followup::RequestAccessToken(handler, config) => {
                    if let Some(session) = self.weak_self.upgrade() {
                        handler(&self.path, &config, session);
                    }
                }
                Followup::DrainUploads {
                    transport,
                    death_count,
                } => {
                    let weak = self.weak_self.clone();
                    transport.async_wait_for_upload_completion(Box::new(move |result| {
                        if result == Err(TransportError::Aborted) {
                            return;
                        }
                        if let Some(session) = weak.upgrade() {
                            session.did_drain_uploads(death_count);
                        }
                    }));
                }
                Followup::RegisterWaits {
                    transport,
                    uploads,
                    downloads,
                } => {
                    for handler in uploads {
                        transport.async_wait_for_upload_completion(handler);
                    }
                    for handler in downloads {
                        transport.async_wait_for_download_completion(handler);
                    }
                }
                Followup::AbortWaits(handlers) => {
                    for handler in handlers {
                        handler(Err(TransportError::Aborted));
                    }
                }
                Followup::InvalidateUser(user) => user.invalidate(),
                Followup::RecordFileAction(record) => {
                    if let Err(e) = self.record_file_action(record) {
                        warn!(path = %self.path.display(), error = %e, "cannot record client reset");
                    }
                }
                Followup::ReportError(handler, error) => {
                    if let Some(session) = self.weak_self.upgrade() {
                        handler(session, error);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

struct ExternalReference {
    session: Arc<Session>,
}

impl Drop for ExternalReference {
    fn drop(&mut self) {
        self.session.did_drop_external_reference();
    }
}

/// A caller's reference to a session.
///
/// Clones share one reference. When the last clone is dropped the session
/// is closed according to its stop policy, and the registry forgets it once
/// it is inactive or failed.
#[derive(Clone)]
pub struct SessionHandle {
    reference: Arc<ExternalReference>,
}

impl SessionHandle {
    /// Returns the session. Holding the result does not keep the session
    /// open.
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.reference.session)
    }
}

impl Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.reference.session
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionHandle")
            .field(&self.reference.session)
            .finish()
    }
}
