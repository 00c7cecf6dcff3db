//! Property tests over random session operation sequences.

use proptest::prelude::*;
use synclane_core::{classify, ErrorAction, ProtocolError, SessionState, StopPolicy};
use synclane_testkit::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A transport exists exactly while waiting, active or dying; each held
    /// session sits in exactly one of its user's maps; failed sessions stay
    /// failed.
    #[test]
    fn invariants_hold_for_any_sequence(
        policy in stop_policy_strategy(),
        ops in session_ops_strategy(40),
    ) {
        let mut driver = SessionDriver::new(policy);
        if let Err(violation) = driver.run(&ops) {
            prop_assert!(false, "{}", violation);
        }
    }

    /// Closing an inactive session changes nothing.
    #[test]
    fn close_on_inactive_is_idempotent(
        policy in stop_policy_strategy(),
        repeats in 1..5usize,
    ) {
        let mut driver = SessionDriver::new(policy);
        driver.run(&[SessionOp::LogOut, SessionOp::Open(0)]).unwrap();
        let session = driver.session(0).unwrap();
        prop_assert_eq!(session.state(), SessionState::Inactive);

        let created = driver.env().factory.created_count();
        for _ in 0..repeats {
            driver.run(&[SessionOp::Close(0)]).unwrap();
        }
        prop_assert_eq!(session.state(), SessionState::Inactive);
        prop_assert_eq!(driver.env().factory.created_count(), created);
        prop_assert_eq!(driver.env().callbacks.bind_count(), 0);
    }

    /// Logging out twice is the same as logging out once.
    #[test]
    fn logout_is_idempotent(ops in session_ops_strategy(10)) {
        let mut driver = SessionDriver::new(StopPolicy::AfterChangesUploaded);
        driver.run(&ops).unwrap();
        driver.run(&[SessionOp::LogOut]).unwrap();

        let waiting = driver.user().waiting_sessions().len();
        let states: Vec<_> = (0..SLOT_COUNT)
            .map(|i| driver.session(i).map(|s| s.state()))
            .collect();
        let created = driver.env().factory.created_count();

        driver.run(&[SessionOp::LogOut]).unwrap();
        prop_assert_eq!(driver.user().waiting_sessions().len(), waiting);
        prop_assert_eq!(driver.env().factory.created_count(), created);
        for (i, before) in states.into_iter().enumerate() {
            prop_assert_eq!(driver.session(i).map(|s| s.state()), before);
        }
    }

    /// The fatal flag decides only for unknown and non-informational
    /// connection-level codes; session-level codes have a fixed action.
    #[test]
    fn classification_is_total(code in 0u16..400, fatal in any::<bool>()) {
        let action = classify(code, fatal);
        let flag_decides = if fatal {
            ErrorAction::FailSession { client_reset: false }
        } else {
            ErrorAction::Report(SessionErrorKind::Debug)
        };
        match ProtocolError::from_code(code) {
            Some(error) if error.is_informational() => prop_assert_eq!(action, ErrorAction::Ignore),
            Some(error) if error.is_connection_level() => prop_assert_eq!(action, flag_decides),
            Some(_) => prop_assert_eq!(action, classify(code, !fatal)),
            None => prop_assert_eq!(action, flag_decides),
        }
    }
}
