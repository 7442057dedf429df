use thiserror::Error;
use uuid::Uuid;

use crate::model::instance::{StateCategory, StateId};

/// Error taxonomy of the execution core.
///
/// `NoTransitionFound` and `DefinitionInconsistency` are fatal configuration
/// errors and are never retried. `Storage` wraps failures raised by the
/// capability traits (stores, queues, connectors).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no next state registered after {state:?} for ({node_type}, {category:?})")]
    NoTransitionFound {
        node_type: &'static str,
        category: StateCategory,
        state: StateId,
    },

    #[error("unknown state id {0:?}")]
    UnknownState(StateId),

    #[error("definition inconsistency in process '{process}': {message}")]
    DefinitionInconsistency { process: String, message: String },

    #[error("failed to load process definition: {0}")]
    DefinitionLoad(String),

    #[error("process definition not deployed: {0}")]
    DefinitionNotFound(String),

    #[error("flow node '{node}' in process '{process}': no outgoing transition satisfied and no default transition")]
    NoTransitionSelected { process: String, node: String },

    #[error("flow node instance not found: {0}")]
    FlowNodeNotFound(Uuid),

    #[error("process instance not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("no token with ref {ref_id} in process instance {process_instance_id}")]
    TokenNotFound {
        process_instance_id: Uuid,
        ref_id: Uuid,
    },

    #[error("guard expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("connector '{name}' failed on node {node_id}: {source}")]
    Connector {
        name: String,
        node_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("flow node {node_id} is in state {state:?}, expected {expected:?}")]
    UnexpectedState {
        node_id: Uuid,
        state: StateId,
        expected: StateId,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
