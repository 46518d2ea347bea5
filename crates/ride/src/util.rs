//! Small helpers over dynamic prop maps.

use serde_json::Value;

use crate::component::Props;

/// Shallow-merge `patch` into `base`, replacing top-level keys.
pub fn merge_into(base: &mut Props, patch: Props) {
    for (key, value) in patch {
        base.insert(key, value);
    }
}

/// Shallow-merged copy of `base` with `patch` applied on top.
pub fn merge(base: &Props, patch: &Props) -> Props {
    let mut merged = base.clone();
    merge_into(&mut merged, patch.clone());
    merged
}

/// Top-level equality of two prop maps.
pub fn shallow_eq(a: &Props, b: &Props) -> bool {
    a.len() == b.len() && a.iter().all(|(key, value)| b.get(key) == Some(value))
}

/// Comparator for fixed-arity tuples: both slices must have length exactly
/// `n` and be element-wise equal. Useful as a memo guard for derived props.
pub fn same_tuple(n: usize) -> impl Fn(&[Value], &[Value]) -> bool {
    move |a, b| a.len() == n && b.len() == n && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Props {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_merge_replaces_top_level_keys() {
        let mut base = props(json!({"a": 1, "b": {"x": 1}}));
        merge_into(&mut base, props(json!({"b": {"y": 2}, "c": 3})));
        assert_eq!(
            Value::Object(base),
            json!({"a": 1, "b": {"y": 2}, "c": 3})
        );
    }

    #[test]
    fn test_shallow_eq() {
        let a = props(json!({"a": 1, "b": 2}));
        let b = props(json!({"b": 2, "a": 1}));
        assert!(shallow_eq(&a, &b));
        assert!(!shallow_eq(&a, &props(json!({"a": 1}))));
    }

    #[test]
    fn test_same_tuple_checks_arity_and_elements() {
        let same = same_tuple(2);
        assert!(same(&[json!(1), json!("x")], &[json!(1), json!("x")]));
        assert!(!same(&[json!(1), json!("x")], &[json!(1), json!("y")]));
        assert!(!same(&[json!(1)], &[json!(1)]));
        let empty = same_tuple(0);
        assert!(empty(&[], &[]));
        assert!(!empty(&[json!(1)], &[json!(1)]));
    }
}
