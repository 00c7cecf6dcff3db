//! # Synclane Testkit
//!
//! Test utilities for synclane.
//!
//! This crate provides:
//! - A test environment wiring a registry to the mock transport
//! - Recording bind and error callbacks
//! - Property-based generators of session operation sequences
//! - A driver that applies those operations and checks the session
//!   invariants after each step
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synclane_testkit::prelude::*;
//!
//! #[test]
//! fn session_binds() {
//!     let env = TestEnv::new();
//!     let user = env.user("alice");
//!     let (session, _transport) = env.open_active(&user, "notes", StopPolicy::Immediately);
//!     assert_eq!(session.state(), SessionState::Active);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod driver;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::driver::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use synclane_core::{
        MockTransport, MockTransportFactory, ProtocolError, SessionConfig, SessionErrorKind,
        SessionHandle, SessionState, StopPolicy, SyncManager, TransportErrorEvent, UserState,
    };
}

pub use driver::*;
pub use fixtures::*;
pub use generators::*;
