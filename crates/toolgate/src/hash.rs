use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Serializes `value` with object keys sorted recursively so that logically
/// equal payloads hash identically regardless of field order.
pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&sort_json_value(value))
}

pub fn canonical_sha256(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let as_value = serde_json::to_value(value)?;
    let canonical = canonical_json(&as_value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sort_json_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted = map
                .iter()
                .map(|(key, value)| (key.clone(), sort_json_value(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(values) => Value::Array(values.iter().map(sort_json_value).collect()),
        _ => value.clone(),
    }
}

/// A one-way-hashed identifier of the form `{kind}:{sha256(raw)}`.
///
/// The only way to build one is through [`HashedIdentifier::from_raw`], so raw
/// user ids and IPs cannot end up in rate-limit keys, cache keys, or logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashedIdentifier(String);

impl HashedIdentifier {
    pub fn from_raw(kind: &str, raw: &str) -> Self {
        let kind = kind.trim();
        let kind = if kind.is_empty() { "anon" } else { kind };
        Self(format!("{kind}:{}", sha256_hex(raw.trim().as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for HashedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}
