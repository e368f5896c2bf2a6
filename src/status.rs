use crate::state::ConnectionState;

/// Connection status summarized across every managed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateStatus {
    /// At least one key is `Open`
    pub any_connected: bool,
    /// The key set is non-empty and every key is `Open`
    pub all_connected: bool,
}

impl AggregateStatus {
    /// Project per-key states into the aggregate booleans.
    ///
    /// An empty set is never "all connected".
    pub fn from_states<'a, I>(states: I) -> Self
    where
        I: IntoIterator<Item = &'a ConnectionState>,
    {
        let mut total = 0usize;
        let mut open = 0usize;
        for state in states {
            total += 1;
            if state.is_open() {
                open += 1;
            }
        }

        Self {
            any_connected: open > 0,
            all_connected: total > 0 && open == total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_state() -> impl Strategy<Value = ConnectionState> {
        prop_oneof![
            Just(ConnectionState::Idle),
            Just(ConnectionState::Connecting),
            Just(ConnectionState::Open),
            Just(ConnectionState::Closed),
            Just(ConnectionState::Failed),
        ]
    }

    #[test]
    fn test_empty_set() {
        let status = AggregateStatus::from_states(&[] as &[ConnectionState]);
        assert!(!status.any_connected);
        assert!(!status.all_connected);
    }

    #[test]
    fn test_partial_open() {
        let states = [ConnectionState::Open, ConnectionState::Failed];
        let status = AggregateStatus::from_states(&states);
        assert!(status.any_connected);
        assert!(!status.all_connected);
    }

    #[test]
    fn test_all_open() {
        let states = [ConnectionState::Open; 3];
        let status = AggregateStatus::from_states(&states);
        assert!(status.any_connected);
        assert!(status.all_connected);
    }

    proptest! {
        #[test]
        fn aggregate_matches_definition(states in proptest::collection::vec(arb_state(), 0..12)) {
            let status = AggregateStatus::from_states(&states);
            let any = states.iter().any(|s| *s == ConnectionState::Open);
            let all = !states.is_empty() && states.iter().all(|s| *s == ConnectionState::Open);
            prop_assert_eq!(status.any_connected, any);
            prop_assert_eq!(status.all_connected, all);
        }

        #[test]
        fn all_connected_implies_any(states in proptest::collection::vec(arb_state(), 0..12)) {
            let status = AggregateStatus::from_states(&states);
            prop_assert!(!status.all_connected || status.any_connected);
        }
    }
}
