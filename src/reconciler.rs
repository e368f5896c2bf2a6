use crate::state::LogicalKey;
use std::collections::HashSet;

/// Open/close work for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Live keys no longer desired
    pub to_close: Vec<LogicalKey>,
    /// Desired keys without a live connection
    pub to_open: Vec<LogicalKey>,
}

impl ReconcilePlan {
    /// Whether the pass has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.to_close.is_empty() && self.to_open.is_empty()
    }
}

/// Outcome of a completed reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose connection was created in this pass
    pub opened: Vec<LogicalKey>,
    /// Keys whose connection was disposed in this pass
    pub closed: Vec<LogicalKey>,
    /// Keys with a live connection once the pass completed, sorted
    pub live: Vec<LogicalKey>,
}

/// Collapse a caller-supplied key list into a set, first occurrence wins.
pub fn normalize_keys<I, K>(keys: I) -> Vec<LogicalKey>
where
    I: IntoIterator<Item = K>,
    K: Into<LogicalKey>,
{
    let mut seen = HashSet::new();
    keys.into_iter()
        .map(Into::into)
        .filter(|key: &LogicalKey| seen.insert(key.clone()))
        .collect()
}

/// Diff the live keys against the desired set.
///
/// Keys present in both are left out of the plan entirely. `to_open`
/// keeps the order of `desired`; `to_close` is sorted.
pub fn plan<'a, I>(current: I, desired: &[LogicalKey]) -> ReconcilePlan
where
    I: IntoIterator<Item = &'a LogicalKey>,
{
    let current: HashSet<&LogicalKey> = current.into_iter().collect();
    let wanted: HashSet<&LogicalKey> = desired.iter().collect();

    let mut to_close: Vec<LogicalKey> = current
        .iter()
        .filter(|key| !wanted.contains(*key))
        .map(|key| (*key).clone())
        .collect();
    to_close.sort();

    let mut queued = HashSet::new();
    let to_open = desired
        .iter()
        .filter(|key| !current.contains(key) && queued.insert(*key))
        .cloned()
        .collect();

    ReconcilePlan { to_close, to_open }
}
