//! Typed ID definitions.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Secret store
// =============================================================================

define_id!(SecretId, prefix = "secret:");

impl SecretId {
    /// Mints a fresh secret ID (used by local secret stores).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("secret:{}", uuid::Uuid::new_v4().simple()))
    }
}

// =============================================================================
// User directory
// =============================================================================

define_id!(UserId);
define_id!(GroupId);

// =============================================================================
// Integrations
// =============================================================================

/// Identifier a connector mints for itself once and publishes to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectorId(uuid::Uuid);

impl ConnectorId {
    /// Creates a new random (v4) connector ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parses a hyphenated UUID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidUuid(e.to_string()))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> uuid::Uuid {
        self.0
    }
}

impl Default for ConnectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for ConnectorId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Relation ID is a host-assigned integer, not a string.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct RelationId(u64);

impl RelationId {
    /// Creates a new RelationId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RelationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| IdError::InvalidRelation(s.to_string()))
    }
}

impl From<u64> for RelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_secret_id_parse() {
        let id = SecretId::parse("secret:cq2jbs7mp25c7b7vb0mg").unwrap();
        assert_eq!(id.as_str(), "secret:cq2jbs7mp25c7b7vb0mg");

        let id = SecretId::parse("secret://f3a1/cq2jbs7mp25c7b7vb0mg").unwrap();
        assert_eq!(id.to_string(), "secret://f3a1/cq2jbs7mp25c7b7vb0mg");
    }

    #[test]
    fn test_secret_id_rejects_bad_shapes() {
        assert_eq!(SecretId::parse(""), Err(IdError::Empty));
        assert_eq!(SecretId::parse("secret:"), Err(IdError::Empty));
        assert!(SecretId::parse("foobar").unwrap_err().is_prefix_error());
        assert_eq!(
            SecretId::parse("secret:a b"),
            Err(IdError::InvalidCharacter { found: ' ' })
        );
    }

    #[test]
    fn test_generated_secret_ids_are_unique() {
        let a = SecretId::generate();
        let b = SecretId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(SecretId::PREFIX));
    }

    #[test]
    fn test_unprefixed_ids() {
        assert!(UserId::parse("88ec0c6a-13ce-5e39-b486-354fe4a7084f").is_ok());
        assert!(GroupId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_serde_as_plain_string() {
        let id = SecretId::parse("secret:abc").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"secret:abc\"");

        let err = serde_json::from_str::<SecretId>("\"nope\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_connector_id() {
        let id = ConnectorId::new();
        let parsed: ConnectorId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.uuid().get_version_num(), 4);
        assert!(ConnectorId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_relation_id() {
        let id: RelationId = "42".parse().unwrap();
        assert_eq!(id.value(), 42);
        assert!("-1".parse::<RelationId>().is_err());
    }

    proptest! {
        #[test]
        fn secret_id_display_parses_back(suffix in "[a-z0-9]{1,32}") {
            let raw = format!("secret:{suffix}");
            let id = SecretId::parse(&raw).unwrap();
            prop_assert_eq!(SecretId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
