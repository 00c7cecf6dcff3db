//! Integration tests for the session registry, users and sessions.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use synclane_core::{
    EncryptionKey, FileAction, FileActionRecord, MemoryMetadataStore, MetadataMode, MetadataStore,
    MockTransportFactory, ProtocolError, SessionConfig, SessionError, SessionErrorKind,
    SessionState, StopPolicy, SyncError, SyncManager, TransportErrorEvent, UserState,
};
use tempfile::tempdir;

const AUTH: &str = "https://auth.example.com";
const URL: &str = "sync://sync.example.com/notes";

struct Harness {
    factory: Arc<MockTransportFactory>,
    manager: Arc<SyncManager>,
}

impl Harness {
    fn new() -> Self {
        let factory = MockTransportFactory::new();
        let manager = SyncManager::new(factory.clone());
        Self { factory, manager }
    }
}

/// A bind callback that answers synchronously from inside the callback.
fn auto_bind(config: SessionConfig, token: &'static str) -> SessionConfig {
    config.with_bind_handler(move |_path, config, session| {
        session.refresh_access_token(token, Some(&config.realm_url));
    })
}

#[test]
fn bind_callback_may_reenter_session() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let config = auto_bind(
        SessionConfig::new(user, URL).with_custom_file_name("notes"),
        "access",
    );

    let handle = h
        .manager
        .get_or_create_session(Path::new("/data/notes"), config)
        .unwrap();

    assert_eq!(handle.state(), SessionState::Active);
    let transport = h.factory.latest(Path::new("/data/notes")).unwrap();
    assert_eq!(transport.bound_url().as_deref(), Some(URL));
    assert_eq!(transport.access_token().as_deref(), Some("access"));
}

#[test]
fn token_expiry_is_handled_without_reporting() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let binds = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let b = Arc::clone(&binds);
    let e = Arc::clone(&errors);
    let config = SessionConfig::new(user, URL)
        .with_custom_file_name("notes")
        .with_bind_handler(move |_path, config, session| {
            let n = b.fetch_add(1, Ordering::SeqCst);
            session.refresh_access_token(&format!("access-{n}"), Some(&config.realm_url));
        })
        .with_error_handler(move |_session, _error| {
            e.fetch_add(1, Ordering::SeqCst);
        });

    let handle = h
        .manager
        .get_or_create_session(Path::new("/a"), config)
        .unwrap();
    let transport = h.factory.latest(Path::new("/a")).unwrap();

    transport.simulate_error(TransportErrorEvent::new(
        ProtocolError::TokenExpired,
        "token expired",
    ));
    h.manager.flush_client();

    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(binds.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(transport.access_token().as_deref(), Some("access-1"));
    assert_eq!(transport.bind_count(), 1);
}

#[test]
fn duplicate_default_path_session_is_rejected() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();

    let _first = h
        .manager
        .get_or_create_session(
            Path::new("/first"),
            SessionConfig::new(Arc::clone(&user), URL),
        )
        .unwrap();
    let second = h
        .manager
        .get_or_create_session(Path::new("/second"), SessionConfig::new(user, URL));

    assert!(matches!(
        second,
        Err(SyncError::DuplicateDefaultSession { .. })
    ));
    assert!(h.manager.get_existing_session(Path::new("/second")).is_none());
}

#[test]
fn failed_session_is_reclaimed_when_released() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let reported = Arc::new(Mutex::new(Vec::<SessionError>::new()));

    let r = Arc::clone(&reported);
    let config = auto_bind(
        SessionConfig::new(user, URL)
            .with_custom_file_name("notes")
            .with_error_handler(move |_session, error| r.lock().push(error)),
        "access",
    );
    let handle = h
        .manager
        .get_or_create_session(Path::new("/a"), config)
        .unwrap();
    let transport = h.factory.latest(Path::new("/a")).unwrap();

    transport.simulate_error(TransportErrorEvent::new(ProtocolError::BadChangeset, "bad"));
    h.manager.flush_client();

    assert!(handle.is_in_error_state());
    assert!(transport.is_closed());
    {
        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind, SessionErrorKind::SessionFatal);
        assert_eq!(reported[0].protocol_error(), Some(ProtocolError::BadChangeset));
    }

    // Still registered while the caller holds it.
    assert!(h.manager.get_existing_active_session(Path::new("/a")).is_some());
    drop(handle);
    assert!(h.manager.get_existing_session(Path::new("/a")).is_none());
    assert!(!h.manager.has_existing_sessions());
}

#[test]
fn client_reset_records_backup_action() {
    let temp = tempdir().unwrap();
    let store = Arc::new(MemoryMetadataStore::new());
    let h = Harness::new();
    h.manager
        .configure_file_system_with_store(temp.path(), store.clone())
        .unwrap();

    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let path = h.manager.path_for_realm(&user, URL).unwrap();
    let reported = Arc::new(Mutex::new(None::<SessionError>));
    let r = Arc::clone(&reported);
    let config = auto_bind(
        SessionConfig::new(user, URL).with_error_handler(move |_s, e| *r.lock() = Some(e)),
        "access",
    );
    let handle = h.manager.get_or_create_session(&path, config).unwrap();
    let transport = h.factory.latest(&path).unwrap();

    transport.simulate_error(TransportErrorEvent::new(
        ProtocolError::DivergingHistories,
        "client reset required",
    ));
    h.manager.flush_client();
    assert_eq!(handle.state(), SessionState::Error);

    let error = reported.lock().take().unwrap();
    let recovery: PathBuf = error.recovery_path.clone().unwrap();
    assert!(recovery.starts_with(h.manager.recovery_directory_path().unwrap().unwrap()));

    let action = store.file_action_for(&path).unwrap().unwrap();
    assert_eq!(action.action, FileAction::BackUpThenDeleteRealm);
    assert_eq!(action.new_path.as_deref(), Some(recovery.as_path()));
    assert_eq!(action.user_identity, "alice");

    // The realm file is backed up and removed on the next sweep.
    std::fs::write(&path, b"local changes").unwrap();
    drop(handle);
    assert!(h.manager.immediately_run_file_actions(&path).unwrap());
    assert!(!path.exists());
    assert_eq!(std::fs::read(&recovery).unwrap(), b"local changes");
}

#[test]
fn auth_failure_invalidates_user() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let k = Arc::clone(&kinds);
    let config = auto_bind(
        SessionConfig::new(Arc::clone(&user), URL)
            .with_custom_file_name("notes")
            .with_error_handler(move |_s, e| k.lock().push(e.kind)),
        "access",
    );
    let handle = h
        .manager
        .get_or_create_session(Path::new("/a"), config)
        .unwrap();
    let transport = h.factory.latest(Path::new("/a")).unwrap();

    transport.simulate_error(TransportErrorEvent::new(
        ProtocolError::BadAuthentication,
        "revoked",
    ));
    h.manager.flush_client();

    assert_eq!(handle.state(), SessionState::Error);
    assert_eq!(user.state(), UserState::Error);
    assert_eq!(*kinds.lock(), vec![SessionErrorKind::UserFatal]);

    handle.refresh_access_token("again", Some(URL));
    handle.bind_with_admin_token("admin", URL);
    assert_eq!(handle.state(), SessionState::Error);
    assert_eq!(transport.refresh_count(), 0);
    assert_eq!(h.factory.created_count(), 1);

    assert!(matches!(
        h.manager.get_user("alice", "new", AUTH),
        Err(SyncError::UserInvalidated { .. })
    ));
}

#[test]
fn logout_and_login_round_trip() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let mut handles = Vec::new();
    for name in ["a", "b"] {
        let config = auto_bind(
            SessionConfig::new(Arc::clone(&user), URL).with_custom_file_name(name),
            "access",
        );
        handles.push(
            h.manager
                .get_or_create_session(&Path::new("/data").join(name), config)
                .unwrap(),
        );
    }
    assert!(handles.iter().all(|s| s.state() == SessionState::Active));

    user.log_out();
    user.log_out();
    assert_eq!(user.state(), UserState::LoggedOut);
    assert!(handles.iter().all(|s| s.state() == SessionState::Inactive));
    assert!(user.all_sessions().is_empty());
    assert_eq!(user.waiting_sessions().len(), 2);

    // Logging in again through the registry revives the parked sessions.
    let again = h.manager.get_user("alice", "refresh-2", AUTH).unwrap();
    assert!(Arc::ptr_eq(&user, &again));
    assert!(handles.iter().all(|s| s.state() == SessionState::Active));
    assert_eq!(user.all_sessions().len(), 2);
    assert!(user.waiting_sessions().is_empty());
    assert_eq!(h.factory.created_count(), 4);
}

#[test]
fn admin_user_binds_immediately() {
    let h = Harness::new();
    let admin = h
        .manager
        .get_admin_token_user("https://server.example.com", "admin-token");
    let binds = Arc::new(AtomicUsize::new(0));
    let b = Arc::clone(&binds);
    let config = SessionConfig::new(Arc::clone(&admin), URL)
        .with_custom_file_name("admin")
        .with_bind_handler(move |_, _, _| {
            b.fetch_add(1, Ordering::SeqCst);
        });

    let handle = h
        .manager
        .get_or_create_session(Path::new("/admin"), config)
        .unwrap();
    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(binds.load(Ordering::SeqCst), 0);
    let transport = h.factory.latest(Path::new("/admin")).unwrap();
    assert_eq!(transport.access_token().as_deref(), Some("admin-token"));

    admin.log_out();
    assert_eq!(handle.state(), SessionState::Active);
}

#[test]
fn dying_session_finishes_after_upload() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let config = auto_bind(
        SessionConfig::new(user, URL)
            .with_custom_file_name("notes")
            .with_stop_policy(StopPolicy::AfterChangesUploaded),
        "access",
    );
    let handle = h
        .manager
        .get_or_create_session(Path::new("/a"), config)
        .unwrap();
    let session = handle.session();
    let transport = h.factory.latest(Path::new("/a")).unwrap();

    drop(handle);
    assert_eq!(session.state(), SessionState::Dying);
    assert!(h.manager.get_existing_session(Path::new("/a")).is_some());

    transport.complete_uploads(Ok(()));
    h.manager.flush_client();
    assert_eq!(session.state(), SessionState::Inactive);
    assert!(transport.is_closed());
    assert!(h.manager.get_existing_session(Path::new("/a")).is_none());
}

#[test]
fn stopping_client_aborts_drain() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let config = auto_bind(
        SessionConfig::new(user, URL).with_custom_file_name("notes"),
        "access",
    );
    let handle = h
        .manager
        .get_or_create_session(Path::new("/a"), config)
        .unwrap();
    let session = handle.session();
    drop(handle);
    assert_eq!(session.state(), SessionState::Dying);

    h.manager.reset_for_testing();
    assert_eq!(session.state(), SessionState::Dying);
    assert!(!session.wait_for_upload_completion_blocking());
}

#[test]
fn configuration_is_locked_after_first_session() {
    let h = Harness::new();
    h.manager.enable_session_multiplexing(true).unwrap();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let _handle = h
        .manager
        .get_or_create_session(
            Path::new("/a"),
            SessionConfig::new(user, URL).with_custom_file_name("a"),
        )
        .unwrap();

    assert!(matches!(
        h.manager.enable_session_multiplexing(false),
        Err(SyncError::ConfigurationLocked { .. })
    ));
    assert!(h.manager.client().unwrap().config().multiplex_sessions);
}

#[test]
fn startup_sweep_runs_persisted_actions() {
    let temp = tempdir().unwrap();
    let key = EncryptionKey::generate();
    let target = temp.path().join("doomed.realm");
    std::fs::write(&target, b"x").unwrap();

    {
        let h = Harness::new();
        h.manager
            .configure_file_system(temp.path(), MetadataMode::Encryption(key.clone()))
            .unwrap();
        h.manager
            .perform_metadata_update(|store| {
                store.add_file_action(FileActionRecord::delete(&target, URL, "alice"))
            })
            .unwrap();
        h.manager.get_user("alice", "refresh", AUTH).unwrap();
    }
    assert!(target.exists());

    let h = Harness::new();
    h.manager
        .configure_file_system(temp.path(), MetadataMode::Encryption(key))
        .unwrap();
    assert!(!target.exists());
    let store = h.manager.metadata_store().unwrap();
    assert!(store.pending_file_actions().unwrap().is_empty());
    assert_eq!(h.manager.all_logged_in_users().len(), 1);
}

#[test]
fn metadata_with_wrong_key_fails() {
    let temp = tempdir().unwrap();
    {
        let h = Harness::new();
        h.manager
            .configure_file_system(temp.path(), MetadataMode::Encryption(EncryptionKey::generate()))
            .unwrap();
        h.manager.get_user("alice", "refresh", AUTH).unwrap();
    }

    let h = Harness::new();
    let result = h.manager.configure_file_system(
        temp.path(),
        MetadataMode::Encryption(EncryptionKey::generate()),
    );
    assert!(matches!(result, Err(SyncError::DecryptionFailed { .. })));
}

#[test]
#[should_panic(expected = "sessions are in use")]
fn reset_with_live_session_panics() {
    let h = Harness::new();
    let user = h.manager.get_user("alice", "refresh", AUTH).unwrap();
    let _handle = h
        .manager
        .get_or_create_session(
            Path::new("/a"),
            SessionConfig::new(user, URL).with_custom_file_name("a"),
        )
        .unwrap();
    h.manager.reset_for_testing();
}
