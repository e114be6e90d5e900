//! Role executors: one uniform contract for every specialized role.
//!
//! The engine resolves a stage's role through a [`RoleRegistry`] and never
//! depends on which concrete executor backs it.

use crate::{ArtifactRef, ArtifactStore, FactoryError, Outcome, RoleType, StageNode, ToolSession};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod backend;
mod command;
mod scripted;

pub use backend::*;
pub use command::*;
pub use scripted::*;

/// Everything one attempt of a stage gets to see.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub stage: StageNode,
    pub attempt: u32,
    pub requirement: Value,
    /// Run context at dispatch time (`feedback`, `artifacts`, clarifications).
    pub context: BTreeMap<String, Value>,
    /// Inbound payload: the predecessor's output, or the failing attempt's
    /// payload when this is a remediation pass.
    pub previous_payload: Option<Value>,
    pub artifact_refs: Vec<ArtifactRef>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub tools: ToolSession,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn role(&self) -> &RoleType {
        &self.stage.role
    }

    pub fn feedback(&self) -> &[Value] {
        self.context
            .get("feedback")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait RoleExecutor: Send + Sync {
    async fn execute(&self, context: &StageContext) -> Result<Outcome, FactoryError>;
}

pub type SharedRoleExecutor = Arc<dyn RoleExecutor>;

#[derive(Clone, Default)]
pub struct RoleRegistry {
    executors: BTreeMap<RoleType, SharedRoleExecutor>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        role: impl Into<RoleType>,
        executor: SharedRoleExecutor,
    ) -> Option<SharedRoleExecutor> {
        self.executors.insert(role.into(), executor)
    }

    pub fn with(mut self, role: impl Into<RoleType>, executor: SharedRoleExecutor) -> Self {
        self.register(role, executor);
        self
    }

    pub fn resolve(&self, role: &RoleType) -> Option<SharedRoleExecutor> {
        self.executors.get(role).cloned()
    }

    pub fn contains(&self, role: &RoleType) -> bool {
        self.executors.contains_key(role)
    }

    pub fn roles(&self) -> Vec<RoleType> {
        self.executors.keys().cloned().collect()
    }
}

/// Every core role backed by `backend`.
pub fn core_registry(backend: Arc<dyn RoleBackend>) -> RoleRegistry {
    let executor: SharedRoleExecutor = Arc::new(BackendRole::new(backend));
    let mut registry = RoleRegistry::new();
    for role in RoleType::core_roles() {
        registry.register(role, Arc::clone(&executor));
    }
    registry
}

/// Offline registry: every core role answers from [`SimulatedBackend`].
pub fn simulated_registry() -> RoleRegistry {
    core_registry(Arc::new(SimulatedBackend))
}
