//! Local state persistence for the operator.
//!
//! SQLite-backed storage for:
//! - the secrets readable by this unit, their revisions and grants
//! - the journal of owned-secret changes awaiting the host

mod journal;
mod store;

pub use journal::{JournalEntry, SecretOp};
pub use store::{LocalSecretStore, SecretRecord, StateStore, StateStoreError};
