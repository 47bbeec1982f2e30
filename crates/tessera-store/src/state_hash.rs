//! Content-addressed state verification.
//!
//! The same attribute set must produce the same hash regardless of storage
//! backend or insertion order. Protocol: normalize missing input to an empty
//! map, serialize to UTF-8 JSON with lexicographically sorted keys and no
//! insignificant whitespace, hash with SHA-256, present as 64-char lowercase
//! hex.

use serde_json::Value;
use sha2::{Digest, Sha256};

use tessera_types::AttrMap;

/// Compute the deterministic SHA-256 content hash of an attribute set.
///
/// `None` hashes identically to an empty map. Keys are sorted by the
/// `BTreeMap` representation, so `{a:1, b:2}` and `{b:2, a:1}` always agree.
pub fn content_hash(attributes: Option<&AttrMap>) -> String {
    static EMPTY: AttrMap = AttrMap::new();
    let attributes = attributes.unwrap_or(&EMPTY);

    // BTreeMap serializes in key order; serde_json emits compact separators.
    let canonical = serde_json::to_string(attributes)
        .expect("attribute maps of JSON values always serialize");

    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Check a live attribute set against a recorded hash.
pub fn verify(attributes: &AttrMap, recorded_hash: &str) -> bool {
    content_hash(Some(attributes)) == recorded_hash
}

/// Human-readable diff between two attribute sets, for audit payloads.
///
/// Returns `{added, removed, modified}` where `modified` maps each changed
/// key to its previous and current value.
pub fn hash_diff(previous: &AttrMap, current: &AttrMap) -> Value {
    let mut added = serde_json::Map::new();
    let mut removed = serde_json::Map::new();
    let mut modified = serde_json::Map::new();

    for (key, value) in current {
        match previous.get(key) {
            None => {
                added.insert(key.clone(), value.clone());
            }
            Some(prev) if prev != value => {
                modified.insert(
                    key.clone(),
                    serde_json::json!({ "previous": prev, "current": value }),
                );
            }
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !current.contains_key(key) {
            removed.insert(key.clone(), value.clone());
        }
    }

    serde_json::json!({
        "added": Value::Object(added),
        "removed": Value::Object(removed),
        "modified": Value::Object(modified),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hash_is_order_independent() {
        let a = attrs(&[("name", json!("Alice")), ("age", json!(30))]);
        let b = attrs(&[("age", json!(30)), ("name", json!("Alice"))]);
        assert_eq!(content_hash(Some(&a)), content_hash(Some(&b)));
    }

    #[test]
    fn none_hashes_like_empty_map() {
        let empty = AttrMap::new();
        assert_eq!(content_hash(None), content_hash(Some(&empty)));
    }

    #[test]
    fn hash_is_64_lowercase_hex_chars() {
        let h = content_hash(Some(&attrs(&[("k", json!(1))])));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn different_values_produce_different_hashes() {
        let a = attrs(&[("amount", json!(500))]);
        let b = attrs(&[("amount", json!(501))]);
        assert_ne!(content_hash(Some(&a)), content_hash(Some(&b)));
    }

    #[test]
    fn verify_detects_drift() {
        let a = attrs(&[("status", json!("pending"))]);
        let recorded = content_hash(Some(&a));
        assert!(verify(&a, &recorded));

        let mut drifted = a.clone();
        drifted.insert("status".into(), json!("approved"));
        assert!(!verify(&drifted, &recorded));
    }

    #[test]
    fn diff_reports_added_removed_modified() {
        let prev = attrs(&[("a", json!(1)), ("b", json!(2))]);
        let curr = attrs(&[("b", json!(3)), ("c", json!(4))]);
        let diff = hash_diff(&prev, &curr);
        assert_eq!(diff["added"]["c"], json!(4));
        assert_eq!(diff["removed"]["a"], json!(1));
        assert_eq!(diff["modified"]["b"]["previous"], json!(2));
        assert_eq!(diff["modified"]["b"]["current"], json!(3));
    }
}
