//! Protocol error codes reported by a transport and how the session layer
//! reacts to each of them.
//!
//! Codes in the 100 range are connection-level, codes in the 200 range are
//! session-level. The session state machine feeds every code through
//! [`classify`] and acts on the resulting [`ErrorAction`].

use std::fmt;
use std::path::PathBuf;

/// Error codes of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProtocolError {
    /// Connection closed (no error).
    ConnectionClosed = 100,
    /// Other connection level error.
    OtherError = 101,
    /// Unknown type of input message.
    UnknownMessage = 102,
    /// Bad syntax in input message head.
    BadSyntax = 103,
    /// Limits exceeded in input message.
    LimitsExceeded = 104,
    /// Wrong protocol version.
    WrongProtocolVersion = 105,
    /// Bad session identifier in input message.
    BadSessionIdent = 106,
    /// Overlapping reuse of session identifier.
    ReuseOfSessionIdent = 107,
    /// Client file bound in other session.
    BoundInOtherSession = 108,
    /// Bad input message order.
    BadMessageOrder = 109,
    /// Error in decompression.
    BadDecompression = 110,
    /// Bad syntax in a changeset header.
    BadChangesetHeaderSyntax = 111,
    /// Bad size specified in changeset header.
    BadChangesetSize = 112,

    /// Session closed (no error).
    SessionClosed = 200,
    /// Other session level error.
    OtherSessionError = 201,
    /// Access token expired.
    TokenExpired = 202,
    /// Bad user authentication.
    BadAuthentication = 203,
    /// Illegal remote path.
    IllegalRealmPath = 204,
    /// No such remote file.
    NoSuchRealm = 205,
    /// Permission denied.
    PermissionDenied = 206,
    /// Bad server file identifier.
    BadServerFileIdent = 207,
    /// Bad client file identifier.
    BadClientFileIdent = 208,
    /// Bad server version.
    BadServerVersion = 209,
    /// Bad client version.
    BadClientVersion = 210,
    /// Diverging histories.
    DivergingHistories = 211,
    /// Bad changeset.
    BadChangeset = 212,
    /// Session disabled by the server.
    DisabledSession = 213,
}

impl ProtocolError {
    /// Every known code, in numeric order.
    pub const ALL: [ProtocolError; 27] = [
        ProtocolError::ConnectionClosed,
        ProtocolError::OtherError,
        ProtocolError::UnknownMessage,
        ProtocolError::BadSyntax,
        ProtocolError::LimitsExceeded,
        ProtocolError::WrongProtocolVersion,
        ProtocolError::BadSessionIdent,
        ProtocolError::ReuseOfSessionIdent,
        ProtocolError::BoundInOtherSession,
        ProtocolError::BadMessageOrder,
        ProtocolError::BadDecompression,
        ProtocolError::BadChangesetHeaderSyntax,
        ProtocolError::BadChangesetSize,
        ProtocolError::SessionClosed,
        ProtocolError::OtherSessionError,
        ProtocolError::TokenExpired,
        ProtocolError::BadAuthentication,
        ProtocolError::IllegalRealmPath,
        ProtocolError::NoSuchRealm,
        ProtocolError::PermissionDenied,
        ProtocolError::BadServerFileIdent,
        ProtocolError::BadClientFileIdent,
        ProtocolError::BadServerVersion,
        ProtocolError::BadClientVersion,
        ProtocolError::DivergingHistories,
        ProtocolError::BadChangeset,
        ProtocolError::DisabledSession,
    ];

    /// Returns the numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a numeric code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// Returns true for connection-level codes.
    #[must_use]
    pub const fn is_connection_level(self) -> bool {
        (self as u16) < 200
    }

    /// Returns true for codes that only announce a normal close.
    #[must_use]
    pub const fn is_informational(self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionClosed
                | ProtocolError::OtherError
                | ProtocolError::SessionClosed
                | ProtocolError::OtherSessionError
                | ProtocolError::DisabledSession
        )
    }

    /// Returns true for errors after which the local file must be backed up
    /// and discarded because it can no longer be reconciled with the server.
    #[must_use]
    pub const fn requires_client_reset(self) -> bool {
        matches!(
            self,
            ProtocolError::BadServerFileIdent
                | ProtocolError::BadClientFileIdent
                | ProtocolError::BadServerVersion
                | ProtocolError::DivergingHistories
        )
    }

    /// Returns a short description of the code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            ProtocolError::ConnectionClosed => "connection closed",
            ProtocolError::OtherError => "other connection level error",
            ProtocolError::UnknownMessage => "unknown type of input message",
            ProtocolError::BadSyntax => "bad syntax in input message head",
            ProtocolError::LimitsExceeded => "limits exceeded in input message",
            ProtocolError::WrongProtocolVersion => "wrong protocol version",
            ProtocolError::BadSessionIdent => "bad session identifier in input message",
            ProtocolError::ReuseOfSessionIdent => "overlapping reuse of session identifier",
            ProtocolError::BoundInOtherSession => "client file bound in other session",
            ProtocolError::BadMessageOrder => "bad input message order",
            ProtocolError::BadDecompression => "error in decompression",
            ProtocolError::BadChangesetHeaderSyntax => "bad syntax in changeset header",
            ProtocolError::BadChangesetSize => "bad changeset size",
            ProtocolError::SessionClosed => "session closed",
            ProtocolError::OtherSessionError => "other session level error",
            ProtocolError::TokenExpired => "access token expired",
            ProtocolError::BadAuthentication => "bad user authentication",
            ProtocolError::IllegalRealmPath => "illegal remote path",
            ProtocolError::NoSuchRealm => "no such remote file",
            ProtocolError::PermissionDenied => "permission denied",
            ProtocolError::BadServerFileIdent => "bad server file identifier",
            ProtocolError::BadClientFileIdent => "bad client file identifier",
            ProtocolError::BadServerVersion => "bad server version",
            ProtocolError::BadClientVersion => "bad client version",
            ProtocolError::DivergingHistories => "diverging histories",
            ProtocolError::BadChangeset => "bad changeset",
            ProtocolError::DisabledSession => "session disabled",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Classification handed to the host's error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Informational; the session keeps running.
    Debug,
    /// The session is dead and must be recreated.
    SessionFatal,
    /// The user lacks permission for the remote file.
    AccessDenied,
    /// The owning user has been invalidated.
    UserFatal,
}

impl SessionErrorKind {
    /// Returns true if the session moved to the error state.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            SessionErrorKind::SessionFatal | SessionErrorKind::UserFatal
        )
    }
}

/// An error reported by the transport of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportErrorEvent {
    /// Numeric protocol code.
    pub code: u16,
    /// Message supplied by the server or transport.
    pub message: String,
    /// Whether the transport considers the session unusable.
    pub is_fatal: bool,
}

impl TransportErrorEvent {
    /// Creates an event for a known protocol code.
    pub fn new(code: ProtocolError, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            is_fatal: false,
        }
    }

    /// Creates an event for a raw numeric code.
    pub fn raw(code: u16, message: impl Into<String>, is_fatal: bool) -> Self {
        Self {
            code,
            message: message.into(),
            is_fatal,
        }
    }

    /// Marks the event as fatal.
    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.is_fatal = true;
        self
    }
}

/// An error surfaced to the host through the session's error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Numeric protocol code.
    pub code: u16,
    /// Message supplied by the server or transport.
    pub message: String,
    /// Classification.
    pub kind: SessionErrorKind,
    /// Where the local file will be backed up before it is discarded, for
    /// errors that require a client reset.
    pub recovery_path: Option<PathBuf>,
}

impl SessionError {
    /// Returns the protocol code if it is a known one.
    #[must_use]
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        ProtocolError::from_code(self.code)
    }

    /// Returns true if the session moved to the error state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error {}: {}", self.kind, self.code, self.message)
    }
}

/// What the session state machine does with a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Informational; dropped silently.
    Ignore,
    /// Ask the host for a fresh access token. Never surfaced.
    RefreshAccessToken,
    /// Move the session to error and invalidate its user.
    InvalidateUser,
    /// Move only this session to error.
    FailSession {
        /// Whether the local file is scheduled for backup and deletion.
        client_reset: bool,
    },
    /// Surface to the host without changing state.
    Report(SessionErrorKind),
}

/// Maps a transport error to the action the session takes.
#[must_use]
pub fn classify(code: u16, is_fatal: bool) -> ErrorAction {
    let Some(error) = ProtocolError::from_code(code) else {
        return if is_fatal {
            ErrorAction::FailSession {
                client_reset: false,
            }
        } else {
            ErrorAction::Report(SessionErrorKind::Debug)
        };
    };

    match error {
        ProtocolError::ConnectionClosed
        | ProtocolError::OtherError
        | ProtocolError::SessionClosed
        | ProtocolError::OtherSessionError
        | ProtocolError::DisabledSession => ErrorAction::Ignore,

        ProtocolError::UnknownMessage
        | ProtocolError::BadSyntax
        | ProtocolError::LimitsExceeded
        | ProtocolError::WrongProtocolVersion
        | ProtocolError::BadSessionIdent
        | ProtocolError::ReuseOfSessionIdent
        | ProtocolError::BoundInOtherSession
        | ProtocolError::BadMessageOrder
        | ProtocolError::BadDecompression
        | ProtocolError::BadChangesetHeaderSyntax
        | ProtocolError::BadChangesetSize => {
            if is_fatal {
                ErrorAction::FailSession {
                    client_reset: false,
                }
            } else {
                ErrorAction::Report(SessionErrorKind::Debug)
            }
        }

        ProtocolError::TokenExpired => ErrorAction::RefreshAccessToken,

        ProtocolError::BadAuthentication => ErrorAction::InvalidateUser,

        ProtocolError::IllegalRealmPath
        | ProtocolError::NoSuchRealm
        | ProtocolError::BadChangeset
        | ProtocolError::BadClientVersion => ErrorAction::FailSession {
            client_reset: false,
        },

        ProtocolError::BadServerFileIdent
        | ProtocolError::BadClientFileIdent
        | ProtocolError::BadServerVersion
        | ProtocolError::DivergingHistories => ErrorAction::FailSession { client_reset: true },

        ProtocolError::PermissionDenied => ErrorAction::Report(SessionErrorKind::AccessDenied),
    }
}
