use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::definition::FlowNodeDef;
use crate::model::instance::{FlowNodeInstance, StateId};
use crate::runtime::RuntimeServices;
use crate::runtime::states::StateCode;
use crate::runtime::store::InstanceStore as _;
use crate::runtime::work::{WorkDescriptor, WorkQueue as _};

/// Drives one flow-node instance through its state sequence, one state per
/// work item. Owns no state of its own; everything goes through the
/// instance store and the work queue.
pub struct FlowNodeExecutor {
    svc: Arc<RuntimeServices>,
}

impl FlowNodeExecutor {
    pub fn new(svc: Arc<RuntimeServices>) -> Self {
        Self { svc }
    }

    /// Definition node backing an instance, or `None` for runtime-added
    /// nodes.
    async fn node_definition(
        &self,
        instance: &FlowNodeInstance,
    ) -> Result<Option<FlowNodeDef>, EngineError> {
        let Some(definition_id) = &instance.definition_id else {
            return Ok(None);
        };
        let process = self
            .svc
            .store
            .get_process(instance.process_instance_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(instance.process_instance_id))?;
        let definition = self.svc.definitions.get(&process.definition_id)?;
        Ok(Some(definition.flow_node(definition_id)?.clone()))
    }

    /// Executes the instance's current state and, when the state reports
    /// done, persists the transition to the successor state.
    pub async fn step_forward(
        &self,
        node_id: Uuid,
        executor_id: Option<u64>,
        substitute_executor_id: Option<u64>,
    ) -> Result<Option<StateId>, EngineError> {
        let Some(mut instance) = self.svc.store.get_flow_node(node_id).await? else {
            warn!(flow_node = %node_id, "stale work item: flow node no longer exists");
            return Ok(None);
        };
        if instance.is_terminal() {
            warn!(flow_node = %node_id, state = instance.state.name(), "stale work item: flow node already terminal");
            return Ok(None);
        }

        let node_def = self.node_definition(&instance).await?;

        // First entry into the state: snapshot it, and stamp the acting
        // users when an external actor drove this step.
        if !instance.executing {
            self.svc.store.archive_flow_node(&instance).await?;
            if executor_id.is_some() || substitute_executor_id.is_some() {
                self.svc
                    .store
                    .set_executor_ids(node_id, executor_id, substitute_executor_id)
                    .await?;
                instance.executor_id = executor_id.or(instance.executor_id);
                instance.substitute_executor_id =
                    substitute_executor_id.or(instance.substitute_executor_id);
            }
        }

        let state = self.svc.states.state(instance.state)?;

        // A category flip that raced this step wins: skip the stale state's
        // effect and let the successor computation jump sequences.
        let code = if state.id().category() != instance.category {
            StateCode::Done
        } else if !state.should_execute(node_def.as_ref(), &instance) {
            StateCode::Done
        } else {
            if let Some(comment) = state.system_comment(&instance) {
                info!(
                    flow_node = %instance.id,
                    process = %instance.process_instance_id,
                    "{comment}"
                );
            }
            state
                .execute(&self.svc, node_def.as_ref(), &mut instance)
                .await?
        };

        match code {
            StateCode::Executing => {
                self.svc.store.set_executing(node_id, true).await?;
                debug!(
                    flow_node = %node_id,
                    state = instance.state.name(),
                    "state suspended on asynchronous work"
                );
                Ok(None)
            }
            StateCode::Done => {
                let next = self
                    .svc
                    .states
                    .next_state(node_def.as_ref(), &instance)?;
                self.svc.store.set_state(node_id, next).await?;
                instance.state = next;
                instance.executing = false;
                debug!(
                    flow_node = %node_id,
                    name = %instance.name,
                    state = next.name(),
                    "flow node reached state"
                );
                self.continue_or_notify(&instance).await?;
                Ok(Some(next))
            }
        }
    }

    /// Resumes a node whose current state suspended on asynchronous work
    /// (a child process, a draining container). The pending work is done:
    /// move to the successor state.
    pub async fn finish_async(&self, node_id: Uuid) -> Result<(), EngineError> {
        let Some(mut instance) = self.svc.store.get_flow_node(node_id).await? else {
            warn!(flow_node = %node_id, "stale resume: flow node no longer exists");
            return Ok(());
        };
        if !instance.executing {
            warn!(
                flow_node = %node_id,
                state = instance.state.name(),
                "resume for a node with no asynchronous work in flight"
            );
        }

        let node_def = self.node_definition(&instance).await?;
        let next = self.svc.states.next_state(node_def.as_ref(), &instance)?;
        self.svc.store.set_state(node_id, next).await?;
        instance.state = next;
        instance.executing = false;
        self.continue_or_notify(&instance).await
    }

    /// A child of a container flow node (e.g. a multi-instance activity)
    /// finished: fold it in and step the parent when its state says so.
    pub async fn child_finished(
        &self,
        _process_definition_id: &str,
        parent_id: Uuid,
        child_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(child) = self.svc.store.get_flow_node(child_id).await? else {
            warn!(flow_node = %child_id, "finished child no longer exists");
            return Ok(());
        };
        self.svc.store.archive_flow_node(&child).await?;
        self.svc.store.delete_flow_node(child_id).await?;

        let Some(mut parent) = self.svc.store.get_flow_node(parent_id).await? else {
            warn!(flow_node = %parent_id, "container of finished child no longer exists");
            return Ok(());
        };
        let remaining = parent.token_count.saturating_sub(1);
        self.svc.store.set_token_count(parent_id, remaining).await?;
        parent.token_count = remaining;

        let state = self.svc.states.state(parent.state)?;
        if !state.hit(&parent, &child) {
            debug!(
                flow_node = %parent_id,
                remaining,
                "container still waiting for children"
            );
            return Ok(());
        }

        self.step_forward(parent_id, None, None).await?;
        Ok(())
    }

    /// Recovery path: park the node in the failed state, remembering where
    /// it was.
    pub async fn move_to_failed(&self, node_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let Some(instance) = self.svc.store.get_flow_node(node_id).await? else {
            warn!(flow_node = %node_id, reason, "cannot fail a flow node that no longer exists");
            return Ok(());
        };
        // A terminal node can still fail while its completion notification
        // is being folded in; parking it keeps the notification replayable.
        if instance.state == StateId::Failed {
            return Ok(());
        }
        warn!(
            flow_node = %node_id,
            name = %instance.name,
            state = instance.state.name(),
            reason,
            "flow node moved to failed"
        );
        self.svc.store.archive_flow_node(&instance).await?;
        self.svc
            .store
            .set_state_before_failure(node_id, Some(instance.state))
            .await?;
        self.svc.store.set_state(node_id, StateId::Failed).await?;
        Ok(())
    }

    /// Puts a failed node back into the state it failed in and re-enqueues
    /// it.
    pub async fn replay(&self, node_id: Uuid) -> Result<(), EngineError> {
        let Some(instance) = self.svc.store.get_flow_node(node_id).await? else {
            return Err(EngineError::FlowNodeNotFound(node_id));
        };
        if instance.state != StateId::Failed {
            return Err(EngineError::UnexpectedState {
                node_id,
                state: instance.state,
                expected: StateId::Failed,
            });
        }
        let resume_state = instance.state_before_failure.unwrap_or_else(|| {
            self.svc
                .states
                .first_state(&instance.kind, instance.category)
                .unwrap_or(StateId::Executing)
        });
        info!(
            flow_node = %node_id,
            name = %instance.name,
            state = resume_state.name(),
            "replaying failed flow node"
        );
        self.svc.store.set_state(node_id, resume_state).await?;
        self.svc
            .store
            .set_state_before_failure(node_id, None)
            .await?;
        // A node that failed while already terminal only has its completion
        // notification left to redo.
        let work = if resume_state.is_terminal() {
            let process = self
                .svc
                .store
                .get_process(instance.process_instance_id)
                .await?
                .ok_or(EngineError::ProcessNotFound(instance.process_instance_id))?;
            WorkDescriptor::NotifyChildFinished {
                process_definition_id: process.definition_id,
                container: instance.parent_container,
                child_id: node_id,
            }
        } else {
            WorkDescriptor::ExecuteFlowNode {
                node_id,
                executor_id: None,
                substitute_executor_id: None,
            }
        };
        self.svc.queue.register_work(work).await?;
        Ok(())
    }

    /// After a persisted transition: report terminal nodes to their
    /// container, keep unstable nodes moving, park stable ones.
    async fn continue_or_notify(&self, instance: &FlowNodeInstance) -> Result<(), EngineError> {
        if instance.state.is_terminal() {
            let process = self
                .svc
                .store
                .get_process(instance.process_instance_id)
                .await?
                .ok_or(EngineError::ProcessNotFound(instance.process_instance_id))?;
            self.svc
                .queue
                .register_work(WorkDescriptor::NotifyChildFinished {
                    process_definition_id: process.definition_id,
                    container: instance.parent_container,
                    child_id: instance.id,
                })
                .await?;
        } else if !instance.state.is_stable() {
            self.svc
                .queue
                .register_work(WorkDescriptor::ExecuteFlowNode {
                    node_id: instance.id,
                    executor_id: None,
                    substitute_executor_id: None,
                })
                .await?;
        } else {
            debug!(
                flow_node = %instance.id,
                name = %instance.name,
                state = instance.state.name(),
                "flow node parked, waiting for an external trigger"
            );
        }
        Ok(())
    }
}
