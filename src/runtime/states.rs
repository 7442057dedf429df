use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::connectors::{ConnectorContext, ConnectorHandler as _, ConnectorOutcome};
use crate::error::EngineError;
use crate::model::definition::{ConnectorDef, FlowNodeDef, NodeKind};
use crate::model::instance::{ContainerId, FlowNodeInstance, StateCategory, StateId};
use crate::runtime::RuntimeServices;
use crate::runtime::interrupt::Interruptor;
use crate::runtime::process::ProcessExecutor;
use crate::runtime::store::{InstanceStore as _, VariableStore as _};
use crate::runtime::work::{WorkDescriptor, WorkQueue as _};

/// What one state-execution step reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    /// The state's effect is finished; the node can advance.
    Done,
    /// The state's effect is asynchronous (pending connector, child process,
    /// draining children). The node stays put until resumed.
    Executing,
}

/// Behavior of one lifecycle state. Stability, terminality and category are
/// metadata of the [`StateId`]; this trait carries the per-step effect.
#[async_trait]
pub trait FlowNodeState: Send + Sync {
    fn id(&self) -> StateId;

    /// Whether this state applies to the given node configuration. Skipped
    /// states let one abstract sequence serve heterogeneous variants.
    fn should_execute(&self, _def: Option<&FlowNodeDef>, _instance: &FlowNodeInstance) -> bool {
        true
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError>;

    /// A child of this node finished: should the parent continue?
    fn hit(&self, parent: &FlowNodeInstance, _child: &FlowNodeInstance) -> bool {
        parent.token_count == 0
    }

    /// System comment to record when this state runs, if the state mandates
    /// one.
    fn system_comment(&self, _instance: &FlowNodeInstance) -> Option<String> {
        None
    }
}

// --- shared helpers ---

/// Runs the connector list from the instance's cursor. A `Pending` outcome
/// leaves the cursor on the pending connector and suspends the state.
async fn run_connectors(
    svc: &Arc<RuntimeServices>,
    connectors: &[ConnectorDef],
    instance: &mut FlowNodeInstance,
) -> Result<StateCode, EngineError> {
    while instance.connector_cursor < connectors.len() {
        let connector = &connectors[instance.connector_cursor];
        let handler = svc.connectors.resolve(&connector.name).ok_or_else(|| {
            EngineError::Connector {
                name: connector.name.clone(),
                node_id: instance.id,
                source: anyhow::anyhow!("no handler registered"),
            }
        })?;
        let ctx = ConnectorContext {
            process_instance_id: instance.process_instance_id,
            node_instance_id: Some(instance.id),
            variables: svc.variables.clone(),
        };
        let outcome =
            handler
                .execute(&connector.params, &ctx)
                .await
                .map_err(|e| EngineError::Connector {
                    name: connector.name.clone(),
                    node_id: instance.id,
                    source: e,
                })?;
        match outcome {
            ConnectorOutcome::Completed(value) => {
                if let (Some(output), Some(v)) = (&connector.output, value) {
                    svc.variables
                        .set_var(instance.process_instance_id, output, v)
                        .await?;
                }
                instance.connector_cursor += 1;
                svc.store
                    .set_connector_cursor(instance.id, instance.connector_cursor)
                    .await?;
            }
            ConnectorOutcome::Pending => return Ok(StateCode::Executing),
        }
    }
    Ok(StateCode::Done)
}

/// Shared abort/cancel behavior: interrupt remaining children and report
/// `Executing` until they have drained.
async fn interrupt_and_drain(
    svc: &Arc<RuntimeServices>,
    instance: &mut FlowNodeInstance,
    category: StateCategory,
) -> Result<StateCode, EngineError> {
    let interruptor = Interruptor::new(svc.clone());

    if let NodeKind::CallActivity { .. } = instance.kind {
        if let Some(child) = svc.store.process_by_caller(instance.id).await? {
            if !child.state.is_terminal() {
                interruptor
                    .interrupt_process_instance(child.id, category, None)
                    .await?;
                return Ok(StateCode::Executing);
            }
        }
        return Ok(StateCode::Done);
    }

    if instance.token_count > 0 {
        interruptor
            .interrupt_children_of_flow_node_instance(instance.id, category)
            .await?;
        return Ok(StateCode::Executing);
    }
    Ok(StateCode::Done)
}

// --- normal-category states ---

/// Runs the node's on-enter connectors.
pub struct InitializingState;

#[async_trait]
impl FlowNodeState for InitializingState {
    fn id(&self) -> StateId {
        StateId::Initializing
    }

    fn should_execute(&self, def: Option<&FlowNodeDef>, _instance: &FlowNodeInstance) -> bool {
        def.is_some_and(|d| !d.on_enter_connectors.is_empty())
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        let connectors = def.map(|d| d.on_enter_connectors.as_slice()).unwrap_or(&[]);
        run_connectors(svc, connectors, instance).await
    }
}

/// Stable park for human tasks. Executed only after an external actor takes
/// the task, which is when the actor ids get stamped.
pub struct ReadyState;

#[async_trait]
impl FlowNodeState for ReadyState {
    fn id(&self) -> StateId {
        StateId::Ready
    }

    async fn execute(
        &self,
        _svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        _instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        Ok(StateCode::Done)
    }

    fn system_comment(&self, instance: &FlowNodeInstance) -> Option<String> {
        let executor = instance.executor_id?;
        match instance.substitute_executor_id {
            Some(sub) if sub != executor => Some(format!(
                "task '{}' executed by user {} on behalf of user {}",
                instance.name, sub, executor
            )),
            _ => Some(format!(
                "task '{}' executed by user {}",
                instance.name, executor
            )),
        }
    }
}

/// Stable park for catch and boundary events, released by `trigger_event`.
pub struct WaitingState;

#[async_trait]
impl FlowNodeState for WaitingState {
    fn id(&self) -> StateId {
        StateId::Waiting
    }

    async fn execute(
        &self,
        _svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        _instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        Ok(StateCode::Done)
    }
}

/// The node's main behavior, dispatched on its kind.
pub struct ExecutingState;

impl ExecutingState {
    async fn execute_multi_instance(
        &self,
        svc: &Arc<RuntimeServices>,
        collection: &str,
        item_variable: &str,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        if instance.executing {
            // Re-stepped by a finishing child; done once all have drained.
            return Ok(if instance.token_count == 0 {
                StateCode::Done
            } else {
                StateCode::Executing
            });
        }

        let items = match svc
            .variables
            .get_var(instance.process_instance_id, collection)
            .await?
        {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        if items.is_empty() {
            return Ok(StateCode::Done);
        }

        for (index, item) in items.iter().enumerate() {
            svc.variables
                .set_var(
                    instance.process_instance_id,
                    &format!("{}_{}", item_variable, index),
                    item.clone(),
                )
                .await?;
            let inner = FlowNodeInstance::new(
                None,
                format!("{}#{}", instance.name, index),
                NodeKind::AutomaticTask,
                instance.process_instance_id,
                instance.root_process_instance_id,
                ContainerId::FlowNode(instance.id),
                svc.states
                    .first_state(&NodeKind::AutomaticTask, StateCategory::Normal)?,
                instance.token_ref,
            );
            let inner_id = inner.id;
            svc.store.create_flow_node(inner).await?;
            svc.queue
                .register_work(WorkDescriptor::ExecuteFlowNode {
                    node_id: inner_id,
                    executor_id: None,
                    substitute_executor_id: None,
                })
                .await?;
        }
        instance.token_count = items.len();
        svc.store.set_token_count(instance.id, items.len()).await?;
        Ok(StateCode::Executing)
    }
}

#[async_trait]
impl FlowNodeState for ExecutingState {
    fn id(&self) -> StateId {
        StateId::Executing
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        match instance.kind.clone() {
            NodeKind::EndEvent { terminating: true } => {
                svc.store
                    .set_interrupting_event(instance.process_instance_id, instance.id)
                    .await?;
                Interruptor::new(svc.clone())
                    .interrupt_siblings(
                        instance.process_instance_id,
                        instance.id,
                        StateCategory::Aborting,
                    )
                    .await?;
                Ok(StateCode::Done)
            }
            NodeKind::BoundaryEvent {
                interrupting: true, ..
            } => {
                if let Some(activity_id) = instance.related_activity_id {
                    Interruptor::new(svc.clone())
                        .interrupt_flow_node_instance_and_children(
                            activity_id,
                            StateCategory::Aborting,
                        )
                        .await?;
                }
                Ok(StateCode::Done)
            }
            NodeKind::CallActivity { definition_id } => {
                let pid = ProcessExecutor::new(svc.clone())
                    .start_sub_process(&definition_id, instance)
                    .await?;
                debug!(caller = %instance.id, child_process = %pid, "call activity started child process");
                Ok(StateCode::Executing)
            }
            NodeKind::MultiInstanceActivity {
                collection,
                item_variable,
            } => {
                self.execute_multi_instance(svc, &collection, &item_variable, instance)
                    .await
            }
            _ => Ok(StateCode::Done),
        }
    }
}

/// Runs the node's on-finish connectors.
pub struct CompletingState;

#[async_trait]
impl FlowNodeState for CompletingState {
    fn id(&self) -> StateId {
        StateId::Completing
    }

    fn should_execute(&self, def: Option<&FlowNodeDef>, _instance: &FlowNodeInstance) -> bool {
        def.is_some_and(|d| !d.on_finish_connectors.is_empty())
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        let connectors = def.map(|d| d.on_finish_connectors.as_slice()).unwrap_or(&[]);
        run_connectors(svc, connectors, instance).await
    }
}

pub struct AbortingState;

#[async_trait]
impl FlowNodeState for AbortingState {
    fn id(&self) -> StateId {
        StateId::Aborting
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        interrupt_and_drain(svc, instance, StateCategory::Aborting).await
    }

    fn system_comment(&self, instance: &FlowNodeInstance) -> Option<String> {
        Some(format!("flow node '{}' aborted", instance.name))
    }
}

pub struct CancellingState;

#[async_trait]
impl FlowNodeState for CancellingState {
    fn id(&self) -> StateId {
        StateId::Cancelling
    }

    async fn execute(
        &self,
        svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        interrupt_and_drain(svc, instance, StateCategory::Cancelling).await
    }

    fn system_comment(&self, instance: &FlowNodeInstance) -> Option<String> {
        Some(format!("flow node '{}' cancelled", instance.name))
    }
}

/// Terminal and recovery states carry no behavior: the executor reports a
/// node to its container on the transition into a terminal state and never
/// runs the state itself.
pub struct InertState(pub StateId);

#[async_trait]
impl FlowNodeState for InertState {
    fn id(&self) -> StateId {
        self.0
    }

    async fn execute(
        &self,
        _svc: &Arc<RuntimeServices>,
        _def: Option<&FlowNodeDef>,
        _instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, EngineError> {
        Ok(StateCode::Done)
    }
}

// --- registry ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SequenceKey {
    HumanTask,
    CatchEvent,
    BoundaryEvent,
    Generic,
}

fn sequence_key(kind: &NodeKind) -> SequenceKey {
    match kind {
        NodeKind::HumanTask => SequenceKey::HumanTask,
        NodeKind::IntermediateCatchEvent => SequenceKey::CatchEvent,
        NodeKind::BoundaryEvent { .. } => SequenceKey::BoundaryEvent,
        _ => SequenceKey::Generic,
    }
}

/// Per-node-type ordered state sequences plus the state behaviors.
/// Built once at wiring time and never mutated.
pub struct StateRegistry {
    states: HashMap<StateId, Arc<dyn FlowNodeState>>,
    sequences: HashMap<(SequenceKey, StateCategory), Vec<StateId>>,
}

impl StateRegistry {
    pub fn bootstrap() -> Self {
        let mut states: HashMap<StateId, Arc<dyn FlowNodeState>> = HashMap::new();
        states.insert(StateId::Initializing, Arc::new(InitializingState));
        states.insert(StateId::Ready, Arc::new(ReadyState));
        states.insert(StateId::Waiting, Arc::new(WaitingState));
        states.insert(StateId::Executing, Arc::new(ExecutingState));
        states.insert(StateId::Completing, Arc::new(CompletingState));
        states.insert(StateId::Aborting, Arc::new(AbortingState));
        states.insert(StateId::Cancelling, Arc::new(CancellingState));
        for terminal in [
            StateId::Completed,
            StateId::Aborted,
            StateId::Cancelled,
            StateId::Failed,
        ] {
            states.insert(terminal, Arc::new(InertState(terminal)));
        }

        let mut sequences = HashMap::new();
        let normal: [(SequenceKey, Vec<StateId>); 4] = [
            (
                SequenceKey::HumanTask,
                vec![
                    StateId::Initializing,
                    StateId::Ready,
                    StateId::Executing,
                    StateId::Completing,
                    StateId::Completed,
                ],
            ),
            (
                SequenceKey::CatchEvent,
                vec![
                    StateId::Initializing,
                    StateId::Waiting,
                    StateId::Executing,
                    StateId::Completed,
                ],
            ),
            (
                SequenceKey::BoundaryEvent,
                vec![StateId::Waiting, StateId::Executing, StateId::Completed],
            ),
            (
                SequenceKey::Generic,
                vec![
                    StateId::Initializing,
                    StateId::Executing,
                    StateId::Completing,
                    StateId::Completed,
                ],
            ),
        ];
        for (key, seq) in normal {
            sequences.insert((key, StateCategory::Normal), seq);
        }
        for key in [
            SequenceKey::HumanTask,
            SequenceKey::CatchEvent,
            SequenceKey::BoundaryEvent,
            SequenceKey::Generic,
        ] {
            sequences.insert(
                (key, StateCategory::Aborting),
                vec![StateId::Aborting, StateId::Aborted],
            );
            sequences.insert(
                (key, StateCategory::Cancelling),
                vec![StateId::Cancelling, StateId::Cancelled],
            );
        }

        Self { states, sequences }
    }

    pub fn state(&self, id: StateId) -> Result<Arc<dyn FlowNodeState>, EngineError> {
        self.states
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownState(id))
    }

    /// First state of the sequence a freshly created node starts in.
    pub fn first_state(
        &self,
        kind: &NodeKind,
        category: StateCategory,
    ) -> Result<StateId, EngineError> {
        let seq = self
            .sequences
            .get(&(sequence_key(kind), category))
            .ok_or_else(|| EngineError::NoTransitionFound {
                node_type: kind.type_name(),
                category,
                state: StateId::Initializing,
            })?;
        Ok(seq[0])
    }

    /// Successor of the instance's current state.
    ///
    /// If an abort/cancel flipped the instance's category since the current
    /// state was entered, jumps to the head of the new category's sequence;
    /// otherwise advances within the sequence. Candidates whose
    /// `should_execute` predicate rejects the node configuration are
    /// skipped. Exhaustion is a fatal configuration error, never a retry
    /// case.
    pub fn next_state(
        &self,
        def: Option<&FlowNodeDef>,
        instance: &FlowNodeInstance,
    ) -> Result<StateId, EngineError> {
        let not_found = || EngineError::NoTransitionFound {
            node_type: instance.kind.type_name(),
            category: instance.category,
            state: instance.state,
        };
        let seq = self
            .sequences
            .get(&(sequence_key(&instance.kind), instance.category))
            .ok_or_else(not_found)?;

        let start = if instance.state.category() != instance.category {
            0
        } else {
            seq.iter()
                .position(|s| *s == instance.state)
                .ok_or_else(not_found)?
                + 1
        };

        for id in &seq[start..] {
            let state = self.state(*id)?;
            if state.should_execute(def, instance) {
                return Ok(*id);
            }
        }
        Err(not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn instance(kind: NodeKind, state: StateId, category: StateCategory) -> FlowNodeInstance {
        let pid = Uuid::new_v4();
        let mut i = FlowNodeInstance::new(
            None,
            "n".to_string(),
            kind,
            pid,
            pid,
            ContainerId::Process(pid),
            state,
            Uuid::new_v4(),
        );
        i.category = category;
        i
    }

    #[test]
    fn every_sequence_reaches_a_terminal_state_in_its_category() {
        let registry = StateRegistry::bootstrap();
        let kinds = [
            NodeKind::AutomaticTask,
            NodeKind::HumanTask,
            NodeKind::IntermediateCatchEvent,
            NodeKind::StartEvent,
            NodeKind::Gateway {
                kind: crate::model::definition::GatewayKind::Parallel,
            },
            NodeKind::BoundaryEvent {
                attached_to: "a".to_string(),
                interrupting: false,
            },
        ];
        for kind in kinds {
            for category in [
                StateCategory::Normal,
                StateCategory::Aborting,
                StateCategory::Cancelling,
            ] {
                let mut current = registry.first_state(&kind, category).unwrap();
                let mut steps = 0;
                while !current.is_terminal() {
                    let inst = instance(kind.clone(), current, category);
                    current = registry.next_state(None, &inst).unwrap();
                    assert_eq!(current.category(), category);
                    steps += 1;
                    assert!(steps < 16, "sequence for {:?}/{:?} does not terminate", kind, category);
                }
            }
        }
    }

    #[test]
    fn category_flip_jumps_to_head_of_exceptional_sequence() {
        let registry = StateRegistry::bootstrap();
        let inst = instance(
            NodeKind::HumanTask,
            StateId::Ready,
            StateCategory::Aborting,
        );
        assert_eq!(registry.next_state(None, &inst).unwrap(), StateId::Aborting);
    }

    #[test]
    fn connectorless_task_skips_initializing_and_completing() {
        let registry = StateRegistry::bootstrap();
        let inst = instance(
            NodeKind::AutomaticTask,
            StateId::Initializing,
            StateCategory::Normal,
        );
        // No definition means no connectors: Initializing -> Executing.
        assert_eq!(registry.next_state(None, &inst).unwrap(), StateId::Executing);
        let inst = instance(
            NodeKind::AutomaticTask,
            StateId::Executing,
            StateCategory::Normal,
        );
        assert_eq!(registry.next_state(None, &inst).unwrap(), StateId::Completed);
    }

    #[test]
    fn terminal_state_has_no_successor() {
        let registry = StateRegistry::bootstrap();
        let inst = instance(
            NodeKind::AutomaticTask,
            StateId::Completed,
            StateCategory::Normal,
        );
        assert!(matches!(
            registry.next_state(None, &inst),
            Err(EngineError::NoTransitionFound { .. })
        ));
    }
}
