use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use octi_reconcile::{DesiredPlan, Supervisor, SupervisorError};
use tracing::debug;

use crate::lock;

/// One call received by [`FakeSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    AddLayer { label: String, combine: bool },
    Replan,
    Start(String),
    Stop(String),
    PushFile(String),
}

/// Supervisor that records calls and keeps the merged layers.
#[derive(Debug)]
pub struct FakeSupervisor {
    connectable: AtomicBool,
    calls: Mutex<Vec<SupervisorCall>>,
    layers: Mutex<BTreeMap<String, DesiredPlan>>,
    files: Mutex<BTreeMap<String, String>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            connectable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            layers: Mutex::new(BTreeMap::new()),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// A supervisor whose socket cannot be reached.
    pub fn unreachable() -> Self {
        let supervisor = Self::new();
        supervisor.set_connectable(false);
        supervisor
    }

    pub fn set_connectable(&self, connectable: bool) {
        self.connectable.store(connectable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SupervisorCall> {
        lock(&self.calls).clone()
    }

    /// Services started, in order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                SupervisorCall::Start(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn layer(&self, label: &str) -> Option<DesiredPlan> {
        lock(&self.layers).get(label).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        lock(&self.files).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: SupervisorCall) -> Result<(), SupervisorError> {
        if !self.connectable.load(Ordering::SeqCst) {
            return Err(SupervisorError::Unreachable("socket not found".to_string()));
        }
        debug!(?call, "[FAKE] supervisor call");
        lock(&self.calls).push(call);
        Ok(())
    }
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn can_connect(&self) -> bool {
        self.connectable.load(Ordering::SeqCst)
    }

    async fn add_layer(
        &self,
        label: &str,
        plan: &DesiredPlan,
        combine: bool,
    ) -> Result<(), SupervisorError> {
        self.record(SupervisorCall::AddLayer {
            label: label.to_string(),
            combine,
        })?;
        let mut layers = lock(&self.layers);
        match layers.get_mut(label) {
            Some(existing) if combine => {
                existing.services.extend(plan.services.clone());
                existing.checks.extend(plan.checks.clone());
            }
            Some(_) => {
                return Err(SupervisorError::Api {
                    status: 400,
                    message: format!("layer {label:?} already exists"),
                })
            }
            None => {
                layers.insert(label.to_string(), plan.clone());
            }
        }
        Ok(())
    }

    async fn replan(&self) -> Result<(), SupervisorError> {
        self.record(SupervisorCall::Replan)
    }

    async fn start(&self, service: &str) -> Result<(), SupervisorError> {
        self.record(SupervisorCall::Start(service.to_string()))
    }

    async fn stop(&self, service: &str) -> Result<(), SupervisorError> {
        self.record(SupervisorCall::Stop(service.to_string()))
    }

    async fn push_file(&self, path: &str, content: &str) -> Result<(), SupervisorError> {
        self.record(SupervisorCall::PushFile(path.to_string()))?;
        lock(&self.files).insert(path.to_string(), content.to_string());
        Ok(())
    }
}
