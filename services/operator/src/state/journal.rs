//! Secret operations the host still has to apply.
//!
//! Secrets this operator owns must live in the host's secret backend so
//! other units and related applications can read them. The local store
//! applies each change immediately and journals it; the journal is handed
//! back with every report until the host has taken it.

use octi_id::SecretId;
use octi_secrets::SecretContent;
use serde::{Deserialize, Serialize};

/// One change to an owned secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum SecretOp {
    Create { id: SecretId, content: SecretContent },
    SetContent { id: SecretId, content: SecretContent },
    /// `scope` is `relation:<id>` or `application:<name>`.
    Grant { id: SecretId, scope: String },
    Remove { id: SecretId },
}

impl SecretOp {
    pub fn secret_id(&self) -> &SecretId {
        match self {
            Self::Create { id, .. }
            | Self::SetContent { id, .. }
            | Self::Grant { id, .. }
            | Self::Remove { id } => id,
        }
    }
}

/// A journaled operation with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: i64,
    pub op: SecretOp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_wire_format() {
        let op = SecretOp::Grant {
            id: SecretId::parse("secret:abc").unwrap(),
            scope: "relation:100".into(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "op": "grant", "id": "secret:abc", "scope": "relation:100" })
        );

        let remove: SecretOp =
            serde_json::from_str(r#"{ "op": "remove", "id": "secret:abc" }"#).unwrap();
        assert_eq!(remove.secret_id().as_str(), "secret:abc");
    }
}
