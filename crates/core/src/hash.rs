//! Content fingerprints for change detection.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Width of the truncated lowercase hex digest.
pub const HASH_HEX_LEN: usize = 16;

/// Serialize `v` with object keys sorted at every level.
pub fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 { out.push(','); }
                // Strings serialize infallibly; fall back to a debug rendering just in case.
                out.push_str(&serde_json::to_string(k).unwrap_or_else(|_| format!("{:?}", k)));
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 { out.push(','); }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Truncated SHA-256 of the canonical form of `v`.
pub fn content_hash(v: &Value) -> String {
    let digest = Sha256::digest(canonical_json(v).as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_under_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":{"y":1,"x":[1,2]},"a":"s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":"s","b":{"x":[1,2],"y":1}}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(canonical_json(&a), r#"{"a":"s","b":{"x":[1,2],"y":1}}"#);
    }

    #[test]
    fn hash_is_truncated_lowercase_hex() {
        let h = content_hash(&json!({"spec": {"enabled": true}}));
        assert_eq!(h.len(), HASH_HEX_LEN);
        assert!(h.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn array_order_changes_hash() {
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }
}
