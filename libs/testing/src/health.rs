use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use octi_reconcile::{HealthProbe, HealthWatcher, ProbeError, ReconcileResult, StatusSink, WatchError};

use crate::lock;

/// Probe that replays scripted answers, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<Result<(), ProbeError>>>,
    fallback: Result<(), ProbeError>,
    probes: AtomicU32,
    urls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with_fallback(Ok(()))
    }

    pub fn unhealthy() -> Self {
        Self::with_fallback(Err(ProbeError::Unhealthy { status: 503 }))
    }

    /// Fail `failures` times, then succeed.
    pub fn healthy_after(failures: usize) -> Self {
        let probe = Self::healthy();
        lock(&probe.script).extend(
            std::iter::repeat_with(|| Err(ProbeError::Transport("connection refused".into())))
                .take(failures),
        );
        probe
    }

    fn with_fallback(fallback: Result<(), ProbeError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            probes: AtomicU32::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        lock(&self.urls).push(url.to_string());
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Sink that keeps every interim status.
#[derive(Debug, Default)]
pub struct RecordingSink {
    statuses: Mutex<Vec<ReconcileResult>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<ReconcileResult> {
        lock(&self.statuses).clone()
    }
}

impl StatusSink for RecordingSink {
    fn interim(&self, status: &ReconcileResult) {
        lock(&self.statuses).push(status.clone());
    }
}

/// Watcher that records the URLs it was armed with.
#[derive(Debug, Default)]
pub struct RecordingWatcher {
    armed: Mutex<Vec<String>>,
}

impl RecordingWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self) -> Vec<String> {
        lock(&self.armed).clone()
    }
}

#[async_trait]
impl HealthWatcher for RecordingWatcher {
    async fn arm(&self, url: &str) -> Result<(), WatchError> {
        lock(&self.armed).push(url.to_string());
        Ok(())
    }
}
