//! Secret handling for the OpenCTI operator.
//!
//! Secrets are small string-keyed documents held by the host's secret
//! store and referenced everywhere else by [`SecretId`]. This crate owns:
//!
//! - [`SecretContent`]: validated content with sorted keys, a canonical
//!   hash for change detection, and redaction for logs
//! - [`SecretStore`]: the collaborator interface (`get`/`create`/
//!   `set_content`/`grant`/`remove`) plus [`InMemorySecretStore`]
//! - token generation for shared credentials
//!
//! # Key format
//!
//! Keys must match `[a-z](-?[a-z0-9]){2,}`: lowercase, hyphen-separated,
//! at least three characters.
//!
//! [`SecretId`]: octi_id::SecretId

mod content;
mod store;
mod token;

pub use content::{redact_for_display, SecretContent, SecretError, MAX_VALUE_LENGTH};
pub use store::{GrantScope, InMemorySecretStore, SecretStore, SecretStoreError};
pub use token::{generate_password, generate_token};
