//! Plan fingerprints.
//!
//! Plans keep every map in a `BTreeMap` and serialize struct fields in
//! declaration order, so their compact JSON is already canonical and is
//! hashed as is.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Fingerprint of a desired plan, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let digest = Sha256::digest(canonical_json(value)?.as_bytes());
        Ok(Self(format!("sha256:{}", hex::encode(digest))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compact JSON of `value`. Stable only for types whose maps are ordered.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Serialize)]
    struct Layer {
        summary: &'static str,
        environment: BTreeMap<&'static str, &'static str>,
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let mut first = BTreeMap::new();
        first.insert("REDIS__PORT", "6379");
        first.insert("APP__PORT", "8080");
        let mut second = BTreeMap::new();
        second.insert("APP__PORT", "8080");
        second.insert("REDIS__PORT", "6379");

        let a = SpecHash::of(&Layer { summary: "opencti", environment: first }).unwrap();
        let b = SpecHash::of(&Layer { summary: "opencti", environment: second }).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_any_value_change_alters_hash() {
        let layer = |port| Layer {
            summary: "opencti",
            environment: BTreeMap::from([("APP__PORT", port)]),
        };
        assert_ne!(
            SpecHash::of(&layer("8080")).unwrap(),
            SpecHash::of(&layer("8081")).unwrap()
        );
    }

    #[test]
    fn test_canonical_json_is_compact() {
        let layer = Layer {
            summary: "echo \"hi\"",
            environment: BTreeMap::from([("B", "2"), ("A", "1")]),
        };
        assert_eq!(
            canonical_json(&layer).unwrap(),
            r#"{"summary":"echo \"hi\"","environment":{"A":"1","B":"2"}}"#
        );
    }
}
