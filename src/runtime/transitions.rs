use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngineError;
use crate::expr::ExpressionEvaluator as _;
use crate::model::definition::{
    FlowNodeDef, GatewayKind, NodeKind, ProcessDefinition, TransitionDef,
};
use crate::model::instance::{FlowNodeInstance, StateCategory};
use crate::runtime::RuntimeServices;
use crate::runtime::store::VariableStore as _;

/// Outcome of evaluating a finished node's outgoing transitions.
#[derive(Debug, Clone)]
pub struct TransitionsWrapper {
    /// Declared incoming transitions of the node.
    pub input_count: usize,
    /// Declared outgoing transitions of the node.
    pub all_outgoing: Vec<TransitionDef>,
    /// Transitions actually taken.
    pub valid_outgoing: Vec<TransitionDef>,
    pub default_transition: Option<TransitionDef>,
}

impl TransitionsWrapper {
    fn empty() -> Self {
        Self {
            input_count: 0,
            all_outgoing: Vec::new(),
            valid_outgoing: Vec::new(),
            default_transition: None,
        }
    }

    /// True when this branch of the process ends here.
    pub fn is_last_flow_node(&self) -> bool {
        self.valid_outgoing.is_empty()
    }
}

/// Decides which outgoing transitions of a finished node are taken.
pub struct TransitionEvaluator {
    svc: Arc<RuntimeServices>,
}

impl TransitionEvaluator {
    pub fn new(svc: Arc<RuntimeServices>) -> Self {
        Self { svc }
    }

    pub async fn build_transitions_wrapper(
        &self,
        definition: &ProcessDefinition,
        node_def: Option<&FlowNodeDef>,
        instance: &FlowNodeInstance,
    ) -> Result<TransitionsWrapper, EngineError> {
        // Runtime-added nodes have no place in the graph.
        let Some(node) = node_def else {
            return Ok(TransitionsWrapper::empty());
        };

        let all_outgoing: Vec<TransitionDef> =
            definition.outgoing(&node.id).into_iter().cloned().collect();
        let default_transition = definition.default_transition(node).cloned();
        let mut wrapper = TransitionsWrapper {
            input_count: definition.incoming(&node.id).len(),
            all_outgoing,
            valid_outgoing: Vec::new(),
            default_transition,
        };

        // An aborting/cancelling node emits no outgoing transitions.
        if instance.category != StateCategory::Normal {
            return Ok(wrapper);
        }

        let variables = self
            .svc
            .variables
            .get_all_vars(instance.process_instance_id)
            .await?;

        wrapper.valid_outgoing = match &node.kind {
            NodeKind::Gateway { kind } => match kind {
                GatewayKind::Exclusive => {
                    vec![self.select_single(definition, node, &wrapper, &variables)?]
                }
                GatewayKind::Parallel => wrapper.all_outgoing.clone(),
                GatewayKind::Inclusive => {
                    self.select_satisfied(definition, node, &wrapper, &variables)?
                }
            },
            // A boundary event firing always follows every path out.
            NodeKind::BoundaryEvent { .. } => wrapper.all_outgoing.clone(),
            _ => {
                if wrapper.all_outgoing.is_empty() {
                    // Implicit end, unless a dangling default transition is
                    // declared.
                    wrapper.default_transition.clone().into_iter().collect()
                } else {
                    // Direct outgoing transitions of an activity behave like
                    // an inline exclusive split.
                    vec![self.select_single(definition, node, &wrapper, &variables)?]
                }
            }
        };

        Ok(wrapper)
    }

    fn guard_passes(
        &self,
        transition: &TransitionDef,
        variables: &HashMap<String, Value>,
    ) -> Result<bool, EngineError> {
        match &transition.guard {
            None => Ok(true),
            Some(guard) => self.svc.expressions.evaluate_guard(guard, variables),
        }
    }

    /// Exclusive selection: first transition whose guard passes, else the
    /// default transition, else a configuration error.
    fn select_single(
        &self,
        definition: &ProcessDefinition,
        node: &FlowNodeDef,
        wrapper: &TransitionsWrapper,
        variables: &HashMap<String, Value>,
    ) -> Result<TransitionDef, EngineError> {
        let default_id = wrapper.default_transition.as_ref().map(|t| t.id.clone());
        for transition in &wrapper.all_outgoing {
            if Some(&transition.id) == default_id.as_ref() {
                continue;
            }
            if self.guard_passes(transition, variables)? {
                return Ok(transition.clone());
            }
        }
        wrapper
            .default_transition
            .clone()
            .ok_or_else(|| EngineError::NoTransitionSelected {
                process: definition.id.clone(),
                node: node.id.clone(),
            })
    }

    /// Inclusive selection: every transition whose guard passes, at least
    /// the default when none qualify.
    fn select_satisfied(
        &self,
        definition: &ProcessDefinition,
        node: &FlowNodeDef,
        wrapper: &TransitionsWrapper,
        variables: &HashMap<String, Value>,
    ) -> Result<Vec<TransitionDef>, EngineError> {
        let default_id = wrapper.default_transition.as_ref().map(|t| t.id.clone());
        let mut satisfied = Vec::new();
        for transition in &wrapper.all_outgoing {
            if Some(&transition.id) == default_id.as_ref() {
                continue;
            }
            if self.guard_passes(transition, variables)? {
                satisfied.push(transition.clone());
            }
        }
        if satisfied.is_empty() {
            let default =
                wrapper
                    .default_transition
                    .clone()
                    .ok_or_else(|| EngineError::NoTransitionSelected {
                        process: definition.id.clone(),
                        node: node.id.clone(),
                    })?;
            satisfied.push(default);
        }
        Ok(satisfied)
    }
}
