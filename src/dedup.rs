//! Suppression of repeated payloads.

/// Returns the payload to store, or `None` when `next` is structurally
/// equal to `previous` and should be absorbed.
///
/// Equality is the payload's `PartialEq`, i.e. value semantics; freshly
/// decoded values never share identity with what is already stored.
#[inline]
pub fn dedupe<P: PartialEq>(previous: Option<&P>, next: P) -> Option<P> {
    match previous {
        Some(prev) if *prev == next => None,
        _ => Some(next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_payload_is_kept() {
        assert_eq!(dedupe(None, json!({"count": 3})), Some(json!({"count": 3})));
    }

    #[test]
    fn test_identical_payload_is_absorbed() {
        let prev = json!({"count": 3, "nested": {"a": [1, 2]}});
        assert_eq!(dedupe(Some(&prev), json!({"count": 3, "nested": {"a": [1, 2]}})), None);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let prev: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let next: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(dedupe(Some(&prev), next), None);
    }

    #[test]
    fn test_changed_payload_passes() {
        let prev = json!({"count": 3});
        assert_eq!(dedupe(Some(&prev), json!({"count": 4})), Some(json!({"count": 4})));
    }
}
