//! Property-based test generators using proptest.
//!
//! Operation sequences address a small fixed set of session slots so that
//! random runs revisit the same paths and exercise reuse, revival and
//! reclamation.

use proptest::prelude::*;
use synclane_core::{ProtocolError, StopPolicy};

/// Number of session slots operations address.
pub const SLOT_COUNT: usize = 3;

/// One step applied by the [`SessionDriver`](crate::driver::SessionDriver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    /// Open the slot's session and keep a handle.
    Open(usize),
    /// Drop the slot's handle.
    Release(usize),
    /// Supply an access token.
    SupplyToken(usize),
    /// Deliver a protocol error through the slot's transport.
    Error(usize, ProtocolError),
    /// Resolve every pending upload wait of the slot's transport.
    CompleteUploads(usize),
    /// Resolve only the oldest pending upload wait.
    CompleteOldestUpload(usize),
    /// Close the session through the handle.
    Close(usize),
    /// Report a local commit.
    Notify(usize, u64),
    /// Ask every session to reconnect.
    Reconnect,
    /// Log the user out.
    LogOut,
    /// Log the user back in.
    LogIn,
}

/// Strategy for slot indices.
pub fn slot_strategy() -> impl Strategy<Value = usize> {
    0..SLOT_COUNT
}

/// Strategy for protocol errors that keep the user logged in.
///
/// Authentication failures are left out; they invalidate the user and
/// every later registration becomes a no-op.
pub fn session_error_strategy() -> impl Strategy<Value = ProtocolError> {
    prop::sample::select(
        ProtocolError::ALL
            .iter()
            .copied()
            .filter(|e| *e != ProtocolError::BadAuthentication)
            .collect::<Vec<_>>(),
    )
}

/// Strategy for stop policies.
pub fn stop_policy_strategy() -> impl Strategy<Value = StopPolicy> {
    prop_oneof![
        Just(StopPolicy::Immediately),
        Just(StopPolicy::LiveIndefinitely),
        Just(StopPolicy::AfterChangesUploaded),
    ]
}

/// Strategy for a single operation.
pub fn session_op_strategy() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        4 => slot_strategy().prop_map(SessionOp::Open),
        3 => slot_strategy().prop_map(SessionOp::Release),
        4 => slot_strategy().prop_map(SessionOp::SupplyToken),
        1 => (slot_strategy(), session_error_strategy())
            .prop_map(|(slot, error)| SessionOp::Error(slot, error)),
        2 => (slot_strategy(), Just(ProtocolError::TokenExpired))
            .prop_map(|(slot, error)| SessionOp::Error(slot, error)),
        3 => slot_strategy().prop_map(SessionOp::CompleteUploads),
        1 => slot_strategy().prop_map(SessionOp::CompleteOldestUpload),
        2 => slot_strategy().prop_map(SessionOp::Close),
        1 => (slot_strategy(), 1..1_000u64).prop_map(|(slot, v)| SessionOp::Notify(slot, v)),
        1 => Just(SessionOp::Reconnect),
        1 => Just(SessionOp::LogOut),
        1 => Just(SessionOp::LogIn),
    ]
}

/// Strategy for operation sequences of up to `max_len` steps.
pub fn session_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<SessionOp>> {
    prop::collection::vec(session_op_strategy(), 1..=max_len)
}
