use dashmap::DashMap;
use std::sync::Arc;

use crate::connectors::ConnectorRegistry;
use crate::error::EngineError;
use crate::expr::ExpressionEvaluator;
use crate::model::definition::ProcessDefinition;
use crate::runtime::ledger::TokenService;
use crate::runtime::lock::LockRegistry;
use crate::runtime::states::StateRegistry;
use crate::runtime::store::{InstanceStore, VariableStore};
use crate::runtime::work::WorkQueue;

pub mod engine;
pub mod flownode;
pub mod interrupt;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod process;
pub mod redis_work;
pub mod states;
pub mod store;
pub mod transitions;
pub mod work;

/// Deployed process definitions, keyed by definition id.
pub struct DefinitionRegistry {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
        }
    }

    pub fn deploy(&self, definition: ProcessDefinition) {
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn get(&self, definition_id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(definition_id)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability bundle shared by the executors and the state behaviors.
/// Wired once at startup; every field is immutable afterwards.
pub struct RuntimeServices {
    pub definitions: Arc<DefinitionRegistry>,
    pub store: Arc<dyn InstanceStore>,
    pub variables: Arc<dyn VariableStore>,
    pub tokens: Arc<dyn TokenService>,
    pub expressions: Arc<dyn ExpressionEvaluator>,
    pub connectors: Arc<ConnectorRegistry>,
    pub queue: Arc<dyn WorkQueue>,
    pub locks: LockRegistry,
    pub states: Arc<StateRegistry>,
}
