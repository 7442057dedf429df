use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connectors::{ConnectorContext, ConnectorHandler as _, ConnectorOutcome};
use crate::error::EngineError;
use crate::model::definition::{
    ConnectorDef, FlowNodeDef, GatewayKind, NodeKind, ProcessDefinition,
};
use crate::model::instance::{
    ContainerId, FlowNodeInstance, ProcessInstance, ProcessState, StateCategory, StateId,
};
use crate::runtime::RuntimeServices;
use crate::runtime::interrupt::Interruptor;
use crate::runtime::ledger::TokenService as _;
use crate::runtime::merge::MergeCalculator;
use crate::runtime::states::StateCode;
use crate::runtime::store::{InstanceStore as _, VariableStore as _};
use crate::runtime::transitions::TransitionEvaluator;
use crate::runtime::work::{WorkDescriptor, WorkQueue as _};

/// Process-level orchestration: instantiation, routing of finished nodes
/// over their outgoing transitions, gateway activation and completion.
pub struct ProcessExecutor {
    svc: Arc<RuntimeServices>,
}

impl ProcessExecutor {
    pub fn new(svc: Arc<RuntimeServices>) -> Self {
        Self { svc }
    }

    /// Starts a top-level process instance.
    pub async fn start(
        &self,
        definition_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        self.start_internal(definition_id, variables, None).await
    }

    /// Starts a child process instance on behalf of a call activity. The
    /// caller stays suspended until the child reports back.
    pub async fn start_sub_process(
        &self,
        definition_id: &str,
        caller: &FlowNodeInstance,
    ) -> Result<Uuid, EngineError> {
        self.start_internal(definition_id, HashMap::new(), Some(caller))
            .await
    }

    async fn start_internal(
        &self,
        definition_id: &str,
        variables: HashMap<String, Value>,
        caller: Option<&FlowNodeInstance>,
    ) -> Result<Uuid, EngineError> {
        let definition = self.svc.definitions.get(definition_id)?;
        let process = ProcessInstance::new(
            definition_id.to_string(),
            caller.map(|c| c.id),
            caller.map(|c| c.root_process_instance_id),
        );
        let process_instance_id = process.id;
        self.svc.store.create_process(process).await?;

        let mut initial = definition.variables.clone();
        initial.extend(variables);
        self.svc
            .variables
            .init_instance(process_instance_id, initial)
            .await?;
        info!(
            process = %process_instance_id,
            definition = %definition.id,
            nested = caller.is_some(),
            "process instance started"
        );

        if !definition.on_enter_connectors.is_empty() {
            self.svc
                .store
                .set_process_state(process_instance_id, ProcessState::Initializing)
                .await?;
            let code = self
                .run_process_connectors(&definition.on_enter_connectors, process_instance_id)
                .await?;
            if code == StateCode::Executing {
                // Resumed through the engine's connector-completion API.
                return Ok(process_instance_id);
            }
            self.svc
                .store
                .set_process_state(process_instance_id, ProcessState::Started)
                .await?;
        }

        self.create_initial_nodes(&definition, process_instance_id)
            .await?;
        Ok(process_instance_id)
    }

    async fn create_initial_nodes(
        &self,
        definition: &ProcessDefinition,
        process_instance_id: Uuid,
    ) -> Result<(), EngineError> {
        let starts = definition.start_nodes();
        if starts.is_empty() {
            return Err(EngineError::DefinitionInconsistency {
                process: definition.id.clone(),
                message: "no start node".to_string(),
            });
        }
        let process = self.require_process(process_instance_id).await?;
        for start in starts {
            let token_ref = Uuid::new_v4();
            self.svc
                .tokens
                .create_tokens(process_instance_id, token_ref, None, 1)
                .await?;
            self.create_and_schedule_node(
                definition,
                start,
                process_instance_id,
                process.root_process_instance_id,
                token_ref,
            )
            .await?;
        }
        Ok(())
    }

    /// Folds a finished top-level node into the process: evaluates its
    /// outgoing transitions, settles tokens, activates targets, and
    /// completes the process when nothing is left.
    pub async fn child_finished(
        &self,
        process_definition_id: &str,
        process_instance_id: Uuid,
        child_id: Uuid,
    ) -> Result<(), EngineError> {
        let definition = self.svc.definitions.get(process_definition_id)?;

        // Routing and token bookkeeping are one critical section per
        // process instance.
        let _guard = self.svc.locks.acquire(process_instance_id).await;

        let Some(child) = self.svc.store.get_flow_node(child_id).await? else {
            debug!(flow_node = %child_id, "finished child already folded in");
            return Ok(());
        };
        let node_def = match &child.definition_id {
            Some(id) => Some(definition.flow_node(id)?.clone()),
            None => None,
        };

        let wrapper = TransitionEvaluator::new(self.svc.clone())
            .build_transitions_wrapper(&definition, node_def.as_ref(), &child)
            .await?;
        let descriptor = MergeCalculator::new(self.svc.clone())
            .compute(node_def.as_ref(), &child, &wrapper)
            .await?;

        self.svc.store.archive_flow_node(&child).await?;
        self.svc.store.delete_flow_node(child_id).await?;
        self.disarm_boundary_events(&child).await?;

        if wrapper.is_last_flow_node() {
            // Aborted/cancelled branches do no token bookkeeping; their
            // tokens are retired with the process instance.
            if child.category == StateCategory::Normal && descriptor.implicit_end {
                self.svc
                    .tokens
                    .consume_tokens(process_instance_id, child.token_ref, 1)
                    .await?;
                // A branch died: an inclusive gateway waiting on this token
                // family may be satisfiable now.
                self.fire_satisfiable_gateways(&definition, process_instance_id)
                    .await?;
            }
        } else {
            if descriptor.consume_input_token {
                let arrived = child.hit_bys.len().max(1);
                self.svc
                    .tokens
                    .consume_tokens(process_instance_id, child.token_ref, arrived)
                    .await?;
            }
            let output_ref = descriptor.output_token_ref.unwrap_or(child.token_ref);
            if descriptor.create_token {
                self.svc
                    .tokens
                    .create_tokens(
                        process_instance_id,
                        output_ref,
                        descriptor.output_parent_token_ref,
                        wrapper.valid_outgoing.len(),
                    )
                    .await?;
            }

            for transition in &wrapper.valid_outgoing {
                let target = definition.flow_node(&transition.target)?;
                if matches!(target.kind, NodeKind::Gateway { .. }) {
                    self.hit_gateway(
                        &definition,
                        target,
                        &transition.id,
                        &transition.source,
                        process_instance_id,
                        child.root_process_instance_id,
                        output_ref,
                    )
                    .await?;
                } else {
                    self.create_and_schedule_node(
                        &definition,
                        target,
                        process_instance_id,
                        child.root_process_instance_id,
                        output_ref,
                    )
                    .await?;
                }
            }
        }

        self.check_process_completion(&definition, process_instance_id)
            .await
    }

    /// Routes one taken transition into a gateway: find or open the gateway
    /// instance for the token family, record the hit, and schedule the
    /// gateway once its merge condition holds.
    #[allow(clippy::too_many_arguments)]
    async fn hit_gateway(
        &self,
        definition: &ProcessDefinition,
        gateway_def: &FlowNodeDef,
        transition_id: &str,
        source_node_id: &str,
        process_instance_id: Uuid,
        root_process_instance_id: Uuid,
        token_ref: Uuid,
    ) -> Result<(), EngineError> {
        let gateway = match self
            .svc
            .store
            .find_active_gateway(process_instance_id, &gateway_def.id, token_ref)
            .await?
        {
            Some(gateway) => gateway,
            None => {
                let instance = FlowNodeInstance::new(
                    Some(gateway_def.id.clone()),
                    gateway_def.name.clone(),
                    gateway_def.kind.clone(),
                    process_instance_id,
                    root_process_instance_id,
                    ContainerId::Process(process_instance_id),
                    self.svc
                        .states
                        .first_state(&gateway_def.kind, StateCategory::Normal)?,
                    token_ref,
                );
                self.svc.store.create_flow_node(instance.clone()).await?;
                instance
            }
        };

        // Hits are de-duplicated per source node: two transitions from the
        // same node carry one token.
        let already_hit = gateway.hit_bys.iter().any(|hit| {
            definition
                .transition(hit)
                .map(|t| t.source == source_node_id)
                .unwrap_or(false)
        });
        let hits = if already_hit {
            gateway.hit_bys.clone()
        } else {
            self.svc
                .store
                .add_gateway_hit(gateway.id, transition_id)
                .await?
        };

        if self
            .merge_condition_satisfied(definition, gateway_def, &hits, process_instance_id, token_ref)
            .await?
        {
            self.svc.store.mark_gateway_fired(gateway.id).await?;
            self.svc
                .queue
                .register_work(WorkDescriptor::ExecuteFlowNode {
                    node_id: gateway.id,
                    executor_id: None,
                    substitute_executor_id: None,
                })
                .await?;
        } else {
            debug!(
                flow_node = %gateway.id,
                gateway = %gateway_def.id,
                hits = hits.len(),
                "gateway waiting for remaining branches"
            );
        }
        Ok(())
    }

    async fn merge_condition_satisfied(
        &self,
        definition: &ProcessDefinition,
        gateway_def: &FlowNodeDef,
        hits: &[String],
        process_instance_id: Uuid,
        token_ref: Uuid,
    ) -> Result<bool, EngineError> {
        match gateway_def.kind.gateway_kind() {
            Some(GatewayKind::Exclusive) => Ok(true),
            Some(GatewayKind::Parallel) => Ok(definition
                .incoming(&gateway_def.id)
                .iter()
                .all(|t| hits.iter().any(|h| *h == t.id))),
            Some(GatewayKind::Inclusive) => {
                // Fires once every token of the family still alive has
                // arrived; branches that died have already retired theirs.
                let alive = self
                    .svc
                    .tokens
                    .count_tokens(process_instance_id, token_ref)
                    .await?;
                Ok(!hits.is_empty() && hits.len() >= alive)
            }
            None => Err(EngineError::DefinitionInconsistency {
                process: definition.id.clone(),
                message: format!("node '{}' hit as a gateway", gateway_def.id),
            }),
        }
    }

    /// Re-checks blocked inclusive gateways after a token of their family
    /// died.
    async fn fire_satisfiable_gateways(
        &self,
        definition: &ProcessDefinition,
        process_instance_id: Uuid,
    ) -> Result<(), EngineError> {
        for gateway in self.svc.store.active_gateways(process_instance_id).await? {
            let Some(definition_id) = &gateway.definition_id else {
                continue;
            };
            let gateway_def = definition.flow_node(definition_id)?;
            if gateway_def.kind.gateway_kind() != Some(GatewayKind::Inclusive) {
                continue;
            }
            if gateway.hit_bys.is_empty() {
                continue;
            }
            if self
                .merge_condition_satisfied(
                    definition,
                    gateway_def,
                    &gateway.hit_bys,
                    process_instance_id,
                    gateway.token_ref,
                )
                .await?
            {
                info!(
                    flow_node = %gateway.id,
                    gateway = %definition_id,
                    "blocked gateway became satisfiable after branch death"
                );
                self.svc.store.mark_gateway_fired(gateway.id).await?;
                self.svc
                    .queue
                    .register_work(WorkDescriptor::ExecuteFlowNode {
                        node_id: gateway.id,
                        executor_id: None,
                        substitute_executor_id: None,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Creates an activity/event instance, arms its boundary events, and
    /// enqueues its first step.
    async fn create_and_schedule_node(
        &self,
        definition: &ProcessDefinition,
        node_def: &FlowNodeDef,
        process_instance_id: Uuid,
        root_process_instance_id: Uuid,
        token_ref: Uuid,
    ) -> Result<(), EngineError> {
        let instance = FlowNodeInstance::new(
            Some(node_def.id.clone()),
            node_def.name.clone(),
            node_def.kind.clone(),
            process_instance_id,
            root_process_instance_id,
            ContainerId::Process(process_instance_id),
            self.svc
                .states
                .first_state(&node_def.kind, StateCategory::Normal)?,
            token_ref,
        );
        let node_id = instance.id;
        self.svc.store.create_flow_node(instance).await?;

        if node_def.kind.accepts_boundary_events() {
            for event_def in definition.boundary_events_of(&node_def.id) {
                let mut event = FlowNodeInstance::new(
                    Some(event_def.id.clone()),
                    event_def.name.clone(),
                    event_def.kind.clone(),
                    process_instance_id,
                    root_process_instance_id,
                    ContainerId::Process(process_instance_id),
                    self.svc
                        .states
                        .first_state(&event_def.kind, StateCategory::Normal)?,
                    token_ref,
                );
                event.related_activity_id = Some(node_id);
                debug!(
                    flow_node = %event.id,
                    event = %event_def.id,
                    activity = %node_id,
                    "boundary event armed"
                );
                // Armed events start in a stable waiting state; no work item.
                self.svc.store.create_flow_node(event).await?;
            }
        }

        self.svc
            .queue
            .register_work(WorkDescriptor::ExecuteFlowNode {
                node_id,
                executor_id: None,
                substitute_executor_id: None,
            })
            .await?;
        Ok(())
    }

    /// Retires boundary events still waiting on a finished activity.
    async fn disarm_boundary_events(
        &self,
        activity: &FlowNodeInstance,
    ) -> Result<(), EngineError> {
        if !activity.kind.accepts_boundary_events() {
            return Ok(());
        }
        let interruptor = Interruptor::new(self.svc.clone());
        for event in self
            .svc
            .store
            .boundary_events_of_activity(activity.id)
            .await?
        {
            if event.state == StateId::Waiting && !event.executing {
                debug!(
                    flow_node = %event.id,
                    activity = %activity.id,
                    "boundary event disarmed"
                );
                interruptor
                    .interrupt_flow_node_instance_and_children(
                        event.id,
                        StateCategory::Aborting,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Resumes a process parked on a pending process-level connector, in
    /// whichever lifecycle phase it is parked.
    pub async fn resume(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        let process = self.require_process(process_instance_id).await?;
        let definition = self.svc.definitions.get(&process.definition_id)?;
        match process.state {
            ProcessState::Initializing => {
                let code = self
                    .run_process_connectors(&definition.on_enter_connectors, process_instance_id)
                    .await?;
                if code == StateCode::Executing {
                    return Ok(());
                }
                self.svc
                    .store
                    .set_process_state(process_instance_id, ProcessState::Started)
                    .await?;
                self.create_initial_nodes(&definition, process_instance_id)
                    .await
            }
            _ => {
                let _guard = self.svc.locks.acquire(process_instance_id).await;
                self.check_process_completion(&definition, process_instance_id)
                    .await
            }
        }
    }

    /// Completes the process once no live flow-node records remain. Must be
    /// called with the process lock held.
    async fn check_process_completion(
        &self,
        definition: &ProcessDefinition,
        process_instance_id: Uuid,
    ) -> Result<(), EngineError> {
        if self
            .svc
            .store
            .count_flow_nodes_in_process(process_instance_id)
            .await?
            > 0
        {
            return Ok(());
        }
        let process = self.require_process(process_instance_id).await?;
        if process.state.is_terminal() {
            return Ok(());
        }

        let terminal = match process.category {
            StateCategory::Normal => {
                if !definition.on_finish_connectors.is_empty() {
                    if process.state != ProcessState::Completing {
                        self.svc
                            .store
                            .set_process_state(process_instance_id, ProcessState::Completing)
                            .await?;
                    }
                    let code = self
                        .run_process_connectors(
                            &definition.on_finish_connectors,
                            process_instance_id,
                        )
                        .await?;
                    if code == StateCode::Executing {
                        return Ok(());
                    }
                }
                ProcessState::Completed
            }
            StateCategory::Aborting => ProcessState::Aborted,
            StateCategory::Cancelling => ProcessState::Cancelled,
        };
        self.finalize(process_instance_id, terminal).await
    }

    async fn finalize(
        &self,
        process_instance_id: Uuid,
        terminal: ProcessState,
    ) -> Result<(), EngineError> {
        self.svc
            .store
            .set_process_state(process_instance_id, terminal)
            .await?;
        self.svc.tokens.delete_all(process_instance_id).await?;
        let process = self.require_process(process_instance_id).await?;
        self.svc.store.archive_process(&process).await?;
        info!(
            process = %process_instance_id,
            definition = %process.definition_id,
            state = ?terminal,
            "process instance ended"
        );
        if let Some(caller_id) = process.caller_id {
            self.svc
                .queue
                .register_work(WorkDescriptor::FinishAsyncWork { node_id: caller_id })
                .await?;
        }
        Ok(())
    }

    /// Runs a process-level connector list from the instance's cursor.
    async fn run_process_connectors(
        &self,
        connectors: &[ConnectorDef],
        process_instance_id: Uuid,
    ) -> Result<StateCode, EngineError> {
        let mut process = self.require_process(process_instance_id).await?;
        while process.connector_cursor < connectors.len() {
            let connector = &connectors[process.connector_cursor];
            let handler = self.svc.connectors.resolve(&connector.name).ok_or_else(|| {
                EngineError::Connector {
                    name: connector.name.clone(),
                    node_id: process_instance_id,
                    source: anyhow::anyhow!("no handler registered"),
                }
            })?;
            let ctx = ConnectorContext {
                process_instance_id,
                node_instance_id: None,
                variables: self.svc.variables.clone(),
            };
            let outcome = handler
                .execute(&connector.params, &ctx)
                .await
                .map_err(|e| EngineError::Connector {
                    name: connector.name.clone(),
                    node_id: process_instance_id,
                    source: e,
                })?;
            match outcome {
                ConnectorOutcome::Completed(value) => {
                    if let (Some(output), Some(v)) = (&connector.output, value) {
                        self.svc
                            .variables
                            .set_var(process_instance_id, output, v)
                            .await?;
                    }
                    process.connector_cursor += 1;
                    self.svc
                        .store
                        .set_process_connector_cursor(process_instance_id, process.connector_cursor)
                        .await?;
                }
                ConnectorOutcome::Pending => return Ok(StateCode::Executing),
            }
        }
        Ok(StateCode::Done)
    }

    async fn require_process(
        &self,
        process_instance_id: Uuid,
    ) -> Result<ProcessInstance, EngineError> {
        self.svc
            .store
            .get_process(process_instance_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_instance_id))
    }
}
