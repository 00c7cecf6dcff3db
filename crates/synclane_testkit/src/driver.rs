//! Applies generated operation sequences to a live registry and checks the
//! session invariants after every step.
//!
//! The driver keeps only weak references to sessions it has released, so
//! the registry alone decides when a session is reclaimed.

use crate::fixtures::{TestEnv, ACCESS_TOKEN, AUTH_URL, REALM_URL};
use crate::generators::{SessionOp, SLOT_COUNT};
use std::sync::{Arc, Weak};
use synclane_core::{
    Session, SessionHandle, SessionState, StopPolicy, TransportErrorEvent, User, UserState,
};

const IDENTITY: &str = "driver-user";

struct Slot {
    name: String,
    handle: Option<SessionHandle>,
    session: Weak<Session>,
    failed: bool,
}

/// Drives one user and a fixed set of session slots.
pub struct SessionDriver {
    env: TestEnv,
    user: Arc<User>,
    policy: StopPolicy,
    slots: Vec<Slot>,
}

impl SessionDriver {
    /// Creates a driver whose sessions use `policy`.
    pub fn new(policy: StopPolicy) -> Self {
        let env = TestEnv::new();
        let user = env.user(IDENTITY);
        let slots = (0..SLOT_COUNT)
            .map(|i| Slot {
                name: format!("slot-{i}"),
                handle: None,
                session: Weak::new(),
                failed: false,
            })
            .collect();
        Self {
            env,
            user,
            policy,
            slots,
        }
    }

    /// Returns the environment.
    pub fn env(&self) -> &TestEnv {
        &self.env
    }

    /// Returns the driven user.
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Returns the live session of `slot`, if any.
    pub fn session(&self, slot: usize) -> Option<Arc<Session>> {
        self.slots[slot].session.upgrade()
    }

    /// Applies every operation, checking invariants after each.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn run(&mut self, ops: &[SessionOp]) -> Result<(), String> {
        for (step, op) in ops.iter().enumerate() {
            self.apply(op);
            self.check_invariants()
                .map_err(|e| format!("step {step} ({op:?}): {e}"))?;
        }
        Ok(())
    }

    /// Applies one operation and waits for its callbacks.
    pub fn apply(&mut self, op: &SessionOp) {
        match op {
            SessionOp::Open(slot) => {
                let name = self.slots[*slot].name.clone();
                let handle = self.env.open(&self.user, &name, self.policy);
                let session = handle.session();
                let slot = &mut self.slots[*slot];
                let same = slot
                    .session
                    .upgrade()
                    .is_some_and(|s| Arc::ptr_eq(&s, &session));
                if !same {
                    slot.session = Arc::downgrade(&session);
                    slot.failed = false;
                }
                slot.handle = Some(handle);
            }
            SessionOp::Release(slot) => {
                self.slots[*slot].handle.take();
            }
            SessionOp::SupplyToken(slot) => {
                if let Some(session) = self.session(*slot) {
                    session.refresh_access_token(ACCESS_TOKEN, Some(REALM_URL));
                }
            }
            SessionOp::Error(slot, error) => {
                if let Some(transport) = self.env.factory.latest(&self.slot_path(*slot)) {
                    transport.simulate_error(TransportErrorEvent::new(*error, "injected"));
                }
            }
            SessionOp::CompleteUploads(slot) => {
                if let Some(transport) = self.env.factory.latest(&self.slot_path(*slot)) {
                    transport.complete_uploads(Ok(()));
                }
            }
            SessionOp::CompleteOldestUpload(slot) => {
                if let Some(transport) = self.env.factory.latest(&self.slot_path(*slot)) {
                    transport.complete_oldest_upload(Ok(()));
                }
            }
            SessionOp::Close(slot) => {
                if let Some(handle) = &self.slots[*slot].handle {
                    handle.close();
                }
            }
            SessionOp::Notify(slot, version) => {
                if let Some(session) = self.session(*slot) {
                    session.nonsync_transact_notify(*version);
                }
            }
            SessionOp::Reconnect => self.env.manager.reconnect(),
            SessionOp::LogOut => self.user.log_out(),
            SessionOp::LogIn => {
                self.env
                    .manager
                    .get_user(IDENTITY, "refresh-again", AUTH_URL)
                    .expect("Failed to log in");
            }
        }
        // Callbacks posted by the first round may post aborted waits.
        self.env.flush();
        self.env.flush();
    }

    /// Checks every invariant against the current state.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn check_invariants(&mut self) -> Result<(), String> {
        let bound = self.user.all_sessions();
        let waiting = self.user.waiting_sessions();

        for session in &bound {
            if waiting.iter().any(|w| Arc::ptr_eq(w, session)) {
                return Err(format!(
                    "{} is both bound and waiting",
                    session.path().display()
                ));
            }
        }

        let user_state = self.user.state();
        let mut any_handle = false;
        for i in 0..self.slots.len() {
            let path = self.slot_path(i);
            let slot = &mut self.slots[i];
            any_handle |= slot.handle.is_some();

            let Some(session) = slot.session.upgrade() else {
                if slot.handle.is_some() {
                    return Err(format!("{} held but dropped", slot.name));
                }
                continue;
            };
            let state = session.state();

            if session.has_transport() != state.has_transport() {
                return Err(format!("{} has_transport disagrees with {state}", slot.name));
            }
            let live_transport = self
                .env
                .factory
                .latest(&path)
                .is_some_and(|t| !t.is_closed());
            if live_transport != state.has_transport() {
                return Err(format!(
                    "{} in {state} but live transport = {live_transport}",
                    slot.name
                ));
            }

            if slot.failed && state != SessionState::Error {
                return Err(format!("{} left the error state for {state}", slot.name));
            }
            slot.failed = state == SessionState::Error;

            let in_bound = bound.iter().any(|s| Arc::ptr_eq(s, &session));
            let in_waiting = waiting.iter().any(|s| Arc::ptr_eq(s, &session));
            let expected = match user_state {
                UserState::Active => (true, false),
                UserState::LoggedOut => (false, true),
                UserState::Error => (false, false),
            };
            if (in_bound, in_waiting) != expected {
                return Err(format!(
                    "{} bound = {in_bound}, waiting = {in_waiting} for {user_state:?} user",
                    slot.name
                ));
            }

            if slot.handle.is_some() {
                let registered = self
                    .env
                    .manager
                    .get_existing_active_session(&path)
                    .is_some_and(|h| Arc::ptr_eq(&h.session(), &session));
                if !registered {
                    return Err(format!("{} held but not registered", slot.name));
                }
            }
        }

        if self.env.manager.has_existing_sessions() != any_handle {
            return Err("has_existing_sessions disagrees with held handles".into());
        }
        Ok(())
    }

    fn slot_path(&self, slot: usize) -> std::path::PathBuf {
        self.env.path(&self.slots[slot].name)
    }
}
