//! Macros for defining typed ID types.

/// Macro to define a typed, opaque string ID.
///
/// This generates a newtype wrapper around `String` with:
/// - `parse()` with shape validation (non-empty, no whitespace or control
///   characters, and the required prefix when one is given)
/// - `as_str()` for borrowing the canonical form
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (as plain strings)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(SecretId, prefix = "secret:");
/// define_id!(UserId);
///
/// let secret: SecretId = "secret:cq2jbs7mp25c7b7vb0mg".parse()?;
/// let user = UserId::parse("88ec0c6a-13ce-5e39-b486-354fe4a7084f")?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, prefix = $prefix:literal) => {
        $crate::define_id!(@body $name, $prefix);
    };
    ($name:ident) => {
        $crate::define_id!(@body $name, "");
    };
    (@body $name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The required prefix for this ID type (empty when unprefixed).
            pub const PREFIX: &'static str = $prefix;

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                if let Some(found) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
                    return Err($crate::IdError::InvalidCharacter { found });
                }

                if !s.starts_with(Self::PREFIX) {
                    let actual = s.chars().take(Self::PREFIX.len()).collect();
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual,
                    });
                }

                if s.len() == Self::PREFIX.len() {
                    return Err($crate::IdError::Empty);
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
