//! # octi-id
//!
//! Typed identifiers used by the OpenCTI operator.
//!
//! ## Design Principles
//!
//! - Identifiers minted by an external system (secret store, user directory)
//!   are opaque strings; we only validate their shape, never their content
//! - Identifiers we mint ourselves are UUIDs
//! - Every identifier is typed so a secret id can never be passed where a
//!   directory user id is expected
//!
//! ## Formats
//!
//! - `SecretId`: `secret:<opaque>` (also accepts `secret://<model>/<opaque>`)
//! - `UserId`, `GroupId`: opaque, non-empty, no whitespace
//! - `ConnectorId`: hyphenated UUID v4
//! - `RelationId`: non-negative integer assigned by the host

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
