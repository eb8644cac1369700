//! Content checksums for deployment templates and parameters
//!
//! A checksum is the hex SHA-256 of the canonical JSON form of a value:
//! object keys sorted recursively, no insignificant whitespace. Two
//! documents that only differ in key order hash the same.

use aws_lc_rs::digest::{digest, SHA256};
use lattice_common::Error;
use serde::Serialize;
use serde_json::Value;

/// Hex SHA-256 of the canonical JSON form of `value`
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> Result<String, Error> {
    let value = serde_json::to_value(value)?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

/// Serialize with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    digest(&SHA256, bytes)
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{:02x}", b);
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_checksum() {
        let a: Value =
            serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).expect("json");
        let b: Value =
            serde_json::from_str(r#"{"a": {"x": "s", "y": [1, 2]}, "b": 1}"#).expect("json");
        assert_eq!(checksum(&a).expect("hash"), checksum(&b).expect("hash"));
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!({"list": [1, 2]});
        let b = json!({"list": [2, 1]});
        assert_ne!(checksum(&a).expect("hash"), checksum(&b).expect("hash"));
    }

    #[test]
    fn test_canonical_form_is_compact_and_sorted() {
        let value = json!({"z": null, "a": [true, "q\"uote"], "m": {"k": 1.5}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[true,"q\"uote"],"m":{"k":1.5},"z":null}"#
        );
    }

    #[test]
    fn test_checksum_is_lowercase_hex_sha256() {
        let sum = checksum(&json!({})).expect("hash");
        // sha256("{}")
        assert_eq!(
            sum,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }
}
