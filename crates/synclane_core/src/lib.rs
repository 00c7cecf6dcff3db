//! # Synclane Core
//!
//! Client-side coordination of sync sessions.
//!
//! This crate provides:
//! - The per-file session state machine (inactive → waiting for token →
//!   active → dying, plus a terminal error state)
//! - A process-wide registry mapping local paths to sessions
//! - Users that own sessions and gate them on login state
//! - The shared worker context that runs transport callbacks
//! - Persistent user and file-action metadata, optionally encrypted
//!
//! ## Architecture
//!
//! The wire protocol is not part of this crate. Sessions talk to the server
//! through the [`SessionTransport`] trait and obtain transports from a
//! [`TransportFactory`]. [`MockTransport`] drives the state machine in tests.
//!
//! ## Key Invariants
//!
//! - A session holds a transport only while waiting, active or dying
//! - The error state is terminal
//! - At most one session per path, and at most one default-path session per
//!   user and URL
//! - Callbacks run only after the session lock is released

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod crypto;
mod error;
mod file_manager;
mod manager;
mod metadata;
mod protocol;
mod session;
mod transport;
mod user;

pub use client::{Job, StopListenerId, SyncClient};
pub use config::{
    BindSessionHandler, ClientConfig, ErrorHandler, LogLevel, MetadataMode, ReconnectMode,
    SessionConfig, StopPolicy, Timeouts,
};
pub use crypto::{EncryptionKey, MetadataCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{SyncError, SyncResult};
pub use file_manager::{escape_file_name, FileActionReport, FileManager};
pub use manager::SyncManager;
pub use metadata::{
    FileAction, FileActionRecord, FileMetadataStore, MemoryMetadataStore, MetadataStore,
    UserRecord,
};
pub use protocol::{
    classify, ErrorAction, ProtocolError, SessionError, SessionErrorKind, TransportErrorEvent,
};
pub use session::{Session, SessionHandle, SessionState};
pub use transport::{
    CompletionHandler, MockTransport, MockTransportFactory, SessionTransport,
    SyncTransactCallback, TransportError, TransportErrorHandler, TransportFactory,
};
pub use user::{TokenType, User, UserState};
