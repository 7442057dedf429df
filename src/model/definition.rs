use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Exclusive,
    Parallel,
    Inclusive,
}

/// Closed set of flow-node kinds. Shared fields live on [`FlowNodeDef`];
/// kind-specific configuration is carried by the variant payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    StartEvent,
    EndEvent {
        /// A terminating end event aborts every sibling branch of the
        /// process instance when it fires.
        #[serde(default)]
        terminating: bool,
    },
    AutomaticTask,
    HumanTask,
    CallActivity {
        definition_id: String,
    },
    MultiInstanceActivity {
        /// Process variable holding the JSON array to expand over.
        collection: String,
        item_variable: String,
    },
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    Gateway {
        kind: GatewayKind,
    },
    BoundaryEvent {
        /// Definition id of the activity this event is attached to.
        attached_to: String,
        #[serde(default)]
        interrupting: bool,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "start_event",
            NodeKind::EndEvent { .. } => "end_event",
            NodeKind::AutomaticTask => "automatic_task",
            NodeKind::HumanTask => "human_task",
            NodeKind::CallActivity { .. } => "call_activity",
            NodeKind::MultiInstanceActivity { .. } => "multi_instance_activity",
            NodeKind::IntermediateCatchEvent => "intermediate_catch_event",
            NodeKind::IntermediateThrowEvent => "intermediate_throw_event",
            NodeKind::Gateway { .. } => "gateway",
            NodeKind::BoundaryEvent { .. } => "boundary_event",
        }
    }

    pub fn gateway_kind(&self) -> Option<GatewayKind> {
        match self {
            NodeKind::Gateway { kind } => Some(*kind),
            _ => None,
        }
    }

    /// Kinds whose runtime instances can contain child flow nodes.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            NodeKind::CallActivity { .. } | NodeKind::MultiInstanceActivity { .. }
        )
    }

    /// Kinds a boundary event may be attached to.
    pub fn accepts_boundary_events(&self) -> bool {
        matches!(
            self,
            NodeKind::AutomaticTask
                | NodeKind::HumanTask
                | NodeKind::CallActivity { .. }
                | NodeKind::MultiInstanceActivity { .. }
        )
    }
}

/// A connector reference: an opaque operation executed on entering or
/// finishing a node (or a whole process). Resolution of `name` to behavior
/// happens in the [`crate::connectors::ConnectorRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// Process variable the connector result is written to, if any.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Guard expression; absence means unconditionally true.
    #[serde(default)]
    pub guard: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
    /// Transition id taken when no guarded transition qualifies.
    #[serde(default)]
    pub default_transition: Option<String>,
    #[serde(default)]
    pub on_enter_connectors: Vec<ConnectorDef>,
    #[serde(default)]
    pub on_finish_connectors: Vec<ConnectorDef>,
}

/// The process graph, read-only during execution. Lookup helpers implement
/// the definition-reader capability consumed by the executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<FlowNodeDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
    /// Initial process variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub on_enter_connectors: Vec<ConnectorDef>,
    #[serde(default)]
    pub on_finish_connectors: Vec<ConnectorDef>,
}

impl ProcessDefinition {
    pub fn flow_node(&self, node_id: &str) -> Result<&FlowNodeDef, EngineError> {
        self.nodes.iter().find(|n| n.id == node_id).ok_or_else(|| {
            EngineError::DefinitionInconsistency {
                process: self.id.clone(),
                message: format!("flow node '{}' not found", node_id),
            }
        })
    }

    pub fn transition(&self, transition_id: &str) -> Result<&TransitionDef, EngineError> {
        self.transitions
            .iter()
            .find(|t| t.id == transition_id)
            .ok_or_else(|| EngineError::DefinitionInconsistency {
                process: self.id.clone(),
                message: format!("transition '{}' not found", transition_id),
            })
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&TransitionDef> {
        self.transitions.iter().filter(|t| t.source == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&TransitionDef> {
        self.transitions.iter().filter(|t| t.target == node_id).collect()
    }

    pub fn default_transition(&self, node: &FlowNodeDef) -> Option<&TransitionDef> {
        let id = node.default_transition.as_deref()?;
        self.transitions.iter().find(|t| t.id == id)
    }

    pub fn start_nodes(&self) -> Vec<&FlowNodeDef> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent))
            .collect()
    }

    /// Boundary event definitions attached to the given activity.
    pub fn boundary_events_of(&self, activity_id: &str) -> Vec<&FlowNodeDef> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(&n.kind, NodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity_id)
            })
            .collect()
    }
}
