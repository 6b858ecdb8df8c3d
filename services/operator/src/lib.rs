//! OpenCTI operator host adapter.
//!
//! Wires the reconciliation controller to the outside world: the host
//! hands over a snapshot of its relations, the operator runs one
//! level-triggered invocation against concrete collaborators and hands
//! back the relation data to publish.
//!
//! ## Modules
//!
//! - `pebble`: process supervisor client over its Unix socket
//! - `health`: HTTP health probe, interim status sink, degraded watcher
//! - `directory`: GraphQL user directory client
//! - `state`: SQLite-backed secret mirror and operation journal
//! - `host`: host event dispatch and snapshot/report file handling

pub mod config;
pub mod directory;
pub mod health;
pub mod host;
pub mod pebble;
pub mod state;

pub use config::{OperatorConfig, Settings};
pub use directory::{GraphqlDirectory, GraphqlDirectoryProvider};
pub use health::{HelperLock, HttpProbe, LogStatusSink, SpawnWatcher};
pub use host::{HostEvent, HostReport};
pub use pebble::PebbleClient;
pub use state::{JournalEntry, LocalSecretStore, SecretOp, StateStore, StateStoreError};
