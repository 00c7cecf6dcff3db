//! Error types for the session layer.

use std::io;
use thiserror::Error;

/// Result type for session layer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the registry, users and metadata stores.
///
/// Protocol errors reported by a transport are not represented here; they
/// are delivered to the session's error handler as
/// [`SessionError`](crate::protocol::SessionError) records.
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Metadata contents are structurally invalid.
    #[error("invalid metadata: {message}")]
    InvalidMetadata {
        /// Description of the problem.
        message: String,
    },

    /// Another process holds the metadata lock.
    #[error("metadata locked: another process has exclusive access")]
    MetadataLocked,

    /// No metadata store has been configured.
    #[error("metadata store is not configured")]
    MetadataUnavailable,

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// A client setting was changed after the sync client was created.
    #[error("cannot change {setting} after the sync client has been created")]
    ConfigurationLocked {
        /// Name of the rejected setting.
        setting: &'static str,
    },

    /// A second default-path session was registered for the same URL.
    #[error("user {identity} already has a default-path session for {url}")]
    DuplicateDefaultSession {
        /// Identity of the owning user.
        identity: String,
        /// Remote URL the sessions share.
        url: String,
    },

    /// The user has been invalidated by a fatal authentication error.
    #[error("user {identity} has been invalidated")]
    UserInvalidated {
        /// Identity of the user.
        identity: String,
    },

    /// An existing user was requested with a different auth server.
    #[error("user {identity} is registered with auth server {existing}, not {requested}")]
    AuthServerMismatch {
        /// Identity of the user.
        identity: String,
        /// Auth server the user was created with.
        existing: String,
        /// Auth server supplied by the caller.
        requested: String,
    },

    /// More than one user is logged in, so there is no single current user.
    #[error("{count} users are logged in; there is no single current user")]
    MultipleUsersLoggedIn {
        /// Number of logged-in users.
        count: usize,
    },
}

impl SyncError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates an invalid metadata error.
    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a configuration locked error.
    pub fn configuration_locked(setting: &'static str) -> Self {
        Self::ConfigurationLocked { setting }
    }

    /// Returns true if this error indicates misuse of the API by the host
    /// application rather than a runtime failure.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigurationLocked { .. }
                | SyncError::DuplicateDefaultSession { .. }
                | SyncError::AuthServerMismatch { .. }
        )
    }
}
