//! Hashing System - SHA-256 for build manifests
//!
//! Provides deterministic, reproducible digests of images, byte maps and the
//! settings a build was produced from.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), sort_value(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Digest of a byte map or any other manifest.
pub fn compute_manifest_hash<T: Serialize>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(manifest)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Identifies the inputs of a build:
/// sha256(declaration + version + canonical settings + engine version)
pub fn compute_build_hash(
    declaration: &str,
    declaration_version: &str,
    settings: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_settings = canonical_json(settings)?;
    let combined = format!("{declaration}:{declaration_version}:{canonical_settings}:{engine_version}");
    Ok(sha256_hex(combined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": {"y": 2, "b": 3}, "m": [{"k": 1, "c": 0}]});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":{"b":3,"y":2},"m":[{"c":0,"k":1}],"z":1}"#);
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_build_hash_tracks_settings() {
        let a = compute_build_hash("fw", "1.0.0", &json!({"baud": 9600}), "1.0.0").unwrap();
        let b = compute_build_hash("fw", "1.0.0", &json!({"baud": 9600}), "1.0.0").unwrap();
        let c = compute_build_hash("fw", "1.0.0", &json!({"baud": 115200}), "1.0.0").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
