//! Test support for the controller crates.
//!
//! In-memory fakes for every collaborator trait, each recording the calls
//! it receives, plus a [`SnapshotBuilder`] producing realistic relation
//! data for the platform's dependencies.

mod directory;
mod health;
mod snapshot;
mod supervisor;

pub use directory::{FakeDirectory, FakeDirectoryProvider};
pub use health::{RecordingSink, RecordingWatcher, ScriptedProbe};
pub use snapshot::SnapshotBuilder;
pub use supervisor::{FakeSupervisor, SupervisorCall};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking test poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
