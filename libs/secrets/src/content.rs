use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum value length in bytes.
pub const MAX_VALUE_LENGTH: usize = 64 * 1024; // 64 KiB

/// Minimum key length accepted by the host secret store.
const MIN_KEY_LENGTH: usize = 3;

/// Secret content errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// Invalid key format.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Invalid value format.
    #[error("invalid value for key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// A key the caller requires is absent.
    #[error("missing key '{0}'")]
    MissingKey(String),
}

/// The content of one secret (key-value pairs).
///
/// Keys are stored in sorted order for deterministic hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct SecretContent {
    inner: BTreeMap<String, String>,
}

impl SecretContent {
    /// Create an empty content document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from an iterator of key-value pairs.
    pub fn try_from_iter<I, K, V>(iter: I) -> Result<Self, SecretError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut content = Self::new();
        for (k, v) in iter {
            content.set(k, v)?;
        }
        Ok(content)
    }

    /// Set a value.
    ///
    /// Returns the previous value if the key existed.
    pub fn set<K: Into<String>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<String>, SecretError> {
        let key = key.into();
        let value = value.into();

        validate_key(&key)?;
        validate_value(&key, &value)?;

        Ok(self.inner.insert(key, value))
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(|s| s.as_str())
    }

    /// Get a value the caller cannot proceed without.
    pub fn require(&self, key: &str) -> Result<&str, SecretError> {
        self.get(key)
            .ok_or_else(|| SecretError::MissingKey(key.to_string()))
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over key-value pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Get all keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(|k| k.as_str())
    }

    /// Compute the SHA-256 hash of the canonical representation.
    ///
    /// Equal content yields equal hashes regardless of insertion order, so
    /// stores can skip no-op updates instead of minting a new revision.
    pub fn data_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.inner {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

impl TryFrom<BTreeMap<String, String>> for SecretContent {
    type Error = SecretError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::try_from_iter(map)
    }
}

impl From<SecretContent> for BTreeMap<String, String> {
    fn from(content: SecretContent) -> Self {
        content.inner
    }
}

/// Validate a key.
fn validate_key(key: &str) -> Result<(), SecretError> {
    let invalid = |reason: &str| SecretError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.len() < MIN_KEY_LENGTH {
        return Err(invalid("key must be at least 3 characters"));
    }

    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("key cannot be empty"));
    };
    if !first.is_ascii_lowercase() {
        return Err(invalid("key must start with a lowercase letter"));
    }

    let mut previous = first;
    for c in chars {
        match c {
            'a'..='z' | '0'..='9' => {}
            '-' if previous != '-' => {}
            '-' => return Err(invalid("key cannot contain consecutive hyphens")),
            other => {
                return Err(SecretError::InvalidKey {
                    key: key.to_string(),
                    reason: format!("invalid character '{other}' in key"),
                })
            }
        }
        previous = c;
    }

    if previous == '-' {
        return Err(invalid("key cannot end with a hyphen"));
    }

    Ok(())
}

/// Validate a value.
fn validate_value(key: &str, value: &str) -> Result<(), SecretError> {
    if value.len() > MAX_VALUE_LENGTH {
        return Err(SecretError::InvalidValue {
            key: key.to_string(),
            reason: format!("value exceeds maximum length of {MAX_VALUE_LENGTH} bytes"),
        });
    }
    Ok(())
}

/// Redact secret content for logging/display.
///
/// Returns a map with all values replaced by `[REDACTED]`.
pub fn redact_for_display(content: &SecretContent) -> BTreeMap<String, String> {
    content
        .keys()
        .map(|k| (k.to_string(), "[REDACTED]".to_string()))
        .collect()
}
