use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::connectors::ConnectorRegistry;
use crate::error::EngineError;
use crate::expr::EvalexprEvaluator;
use crate::model::definition::ProcessDefinition;
use crate::model::instance::{
    ArchivedFlowNodeInstance, FlowNodeInstance, ProcessInstance, StateCategory, StateId,
};
use crate::runtime::flownode::FlowNodeExecutor;
use crate::runtime::interrupt::Interruptor;
use crate::runtime::ledger::InMemoryTokenLedger;
use crate::runtime::lock::LockRegistry;
use crate::runtime::process::ProcessExecutor;
use crate::runtime::states::StateRegistry;
use crate::runtime::store::{
    InMemoryInstanceStore, InMemoryVariableStore, InstanceStore as _, VariableStore as _,
};
use crate::runtime::work::{InMemoryWorkQueue, WorkDescriptor, WorkQueue};
use crate::runtime::{DefinitionRegistry, RuntimeServices};

use crate::model::instance::ContainerId;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Facade over the runtime: deployment, instance lifecycle APIs, and the
/// worker loop that drains the work queue.
pub struct Engine {
    svc: Arc<RuntimeServices>,
    flow_nodes: FlowNodeExecutor,
    processes: ProcessExecutor,
    interruptor: Interruptor,
}

impl Engine {
    /// Fully in-memory wiring with the standard connector handlers. The
    /// setup used by the tests and the single-node worker.
    pub fn in_memory() -> Self {
        Self::in_memory_with_connectors(ConnectorRegistry::standard())
    }

    pub fn in_memory_with_connectors(connectors: ConnectorRegistry) -> Self {
        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::new(DEFAULT_QUEUE_CAPACITY));
        Self::with_queue(queue, connectors)
    }

    /// In-memory state over an external work queue (e.g. Redis), for
    /// multi-worker deployments.
    pub fn with_queue(queue: Arc<dyn WorkQueue>, connectors: ConnectorRegistry) -> Self {
        let svc = Arc::new(RuntimeServices {
            definitions: Arc::new(DefinitionRegistry::new()),
            store: Arc::new(InMemoryInstanceStore::new()),
            variables: Arc::new(InMemoryVariableStore::new()),
            tokens: Arc::new(InMemoryTokenLedger::new()),
            expressions: Arc::new(EvalexprEvaluator),
            connectors: Arc::new(connectors),
            queue,
            locks: LockRegistry::new(),
            states: Arc::new(StateRegistry::bootstrap()),
        });
        Self::from_services(svc)
    }

    pub fn from_services(svc: Arc<RuntimeServices>) -> Self {
        Self {
            flow_nodes: FlowNodeExecutor::new(svc.clone()),
            processes: ProcessExecutor::new(svc.clone()),
            interruptor: Interruptor::new(svc.clone()),
            svc,
        }
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.svc
    }

    pub fn deploy(&self, definition: ProcessDefinition) {
        info!(definition = %definition.id, name = %definition.name, "process definition deployed");
        self.svc.definitions.deploy(definition);
    }

    pub async fn start_process(
        &self,
        definition_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        self.processes.start(definition_id, variables).await
    }

    /// Drains work forever. The deployment entry point for workers.
    pub async fn run_worker(&self) {
        loop {
            match self.svc.queue.pop().await {
                Ok(Some(work)) => self.handle(work).await,
                Ok(None) => {}
                Err(e) => error!(error = %e, "work queue pop failed"),
            }
        }
    }

    /// Drains work until the queue stays idle for one poll interval. Keeps
    /// tests deterministic without sleeping.
    pub async fn run_until_idle(&self) {
        while let Ok(Some(work)) = self.svc.queue.pop().await {
            self.handle(work).await;
        }
    }

    async fn handle(&self, work: WorkDescriptor) {
        debug!(?work, "work item picked up");
        let failed_scope = failed_node_scope(&work);
        if let Err(e) = self.dispatch(work).await {
            error!(error = %e, "work item failed");
            // Park the affected node instead of retrying in a loop; an
            // operator replays it once the cause is fixed.
            if let Some(node_id) = failed_scope {
                if let Err(e) = self
                    .svc
                    .queue
                    .register_work(WorkDescriptor::MoveToFailed {
                        node_id,
                        reason: e.to_string(),
                    })
                    .await
                {
                    error!(error = %e, "could not schedule recovery work");
                }
            }
        }
    }

    async fn dispatch(&self, work: WorkDescriptor) -> Result<(), EngineError> {
        match work {
            WorkDescriptor::ExecuteFlowNode {
                node_id,
                executor_id,
                substitute_executor_id,
            } => self
                .flow_nodes
                .step_forward(node_id, executor_id, substitute_executor_id)
                .await
                .map(|_| ()),
            WorkDescriptor::NotifyChildFinished {
                process_definition_id,
                container,
                child_id,
            } => match container {
                ContainerId::Process(process_instance_id) => {
                    self.processes
                        .child_finished(&process_definition_id, process_instance_id, child_id)
                        .await
                }
                ContainerId::FlowNode(parent_id) => {
                    self.flow_nodes
                        .child_finished(&process_definition_id, parent_id, child_id)
                        .await
                }
            },
            WorkDescriptor::FinishAsyncWork { node_id } => {
                self.flow_nodes.finish_async(node_id).await
            }
            WorkDescriptor::CompleteProcess {
                process_instance_id,
            } => self.processes.resume(process_instance_id).await,
            WorkDescriptor::MoveToFailed { node_id, reason } => {
                self.flow_nodes.move_to_failed(node_id, &reason).await
            }
        }
    }

    // --- external triggers ---

    /// A user takes and executes a parked human task.
    pub async fn execute_human_task(
        &self,
        node_id: Uuid,
        executor_id: u64,
        substitute_executor_id: Option<u64>,
    ) -> Result<(), EngineError> {
        let instance = self.require_flow_node(node_id).await?;
        if instance.state != StateId::Ready || instance.executing {
            return Err(EngineError::UnexpectedState {
                node_id,
                state: instance.state,
                expected: StateId::Ready,
            });
        }
        self.svc
            .queue
            .register_work(WorkDescriptor::ExecuteFlowNode {
                node_id,
                executor_id: Some(executor_id),
                substitute_executor_id: substitute_executor_id.or(Some(executor_id)),
            })
            .await?;
        Ok(())
    }

    /// Releases a waiting catch or boundary event.
    pub async fn trigger_event(&self, node_id: Uuid) -> Result<(), EngineError> {
        let instance = self.require_flow_node(node_id).await?;
        if instance.state != StateId::Waiting || instance.executing {
            return Err(EngineError::UnexpectedState {
                node_id,
                state: instance.state,
                expected: StateId::Waiting,
            });
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

    /// The external side of a pending node connector finished: record its
    /// outputs and resume the suspended state past that connector.
    pub async fn notify_connector_completed(
        &self,
        node_id: Uuid,
        outputs: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        let instance = self.require_flow_node(node_id).await?;
        if !instance.executing {
            return Err(EngineError::UnexpectedState {
                node_id,
                state: instance.state,
                expected: instance.state,
            });
        }
        for (key, value) in outputs {
            self.svc
                .variables
                .set_var(instance.process_instance_id, &key, value)
                .await?;
        }
        self.svc
            .store
            .set_connector_cursor(node_id, instance.connector_cursor + 1)
            .await?;
        self.svc.store.set_executing(node_id, false).await?;
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

    /// Same for a pending process-level connector.
    pub async fn notify_process_connector_completed(
        &self,
        process_instance_id: Uuid,
        outputs: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        let process = self
            .svc
            .store
            .get_process(process_instance_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process_instance_id))?;
        for (key, value) in outputs {
            self.svc
                .variables
                .set_var(process_instance_id, &key, value)
                .await?;
        }
        self.svc
            .store
            .set_process_connector_cursor(process_instance_id, process.connector_cursor + 1)
            .await?;
        self.svc
            .queue
            .register_work(WorkDescriptor::CompleteProcess {
                process_instance_id,
            })
            .await?;
        Ok(())
    }

    pub async fn abort_process(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.interruptor
            .interrupt_process_instance(process_instance_id, StateCategory::Aborting, None)
            .await
    }

    pub async fn cancel_process(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.interruptor
            .interrupt_process_instance(process_instance_id, StateCategory::Cancelling, None)
            .await
    }

    /// Puts a failed node back into the state it failed in.
    pub async fn replay_flow_node(&self, node_id: Uuid) -> Result<(), EngineError> {
        self.flow_nodes.replay(node_id).await
    }

    // --- queries ---

    pub async fn process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Option<ProcessInstance>, EngineError> {
        Ok(self.svc.store.get_process(process_instance_id).await?)
    }

    pub async fn flow_node(
        &self,
        node_id: Uuid,
    ) -> Result<Option<FlowNodeInstance>, EngineError> {
        Ok(self.svc.store.get_flow_node(node_id).await?)
    }

    pub async fn archived_flow_node(
        &self,
        node_id: Uuid,
    ) -> Result<Option<ArchivedFlowNodeInstance>, EngineError> {
        Ok(self.svc.store.get_archived_flow_node(node_id).await?)
    }

    pub async fn get_variable(
        &self,
        process_instance_id: Uuid,
        key: &str,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self.svc.variables.get_var(process_instance_id, key).await?)
    }

    /// Live flow-node instances of a process instance, oldest first.
    pub async fn flow_nodes_of_process(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<FlowNodeInstance>, EngineError> {
        Ok(self
            .svc
            .store
            .children_of(&ContainerId::Process(process_instance_id), 0, usize::MAX)
            .await?)
    }

    async fn require_flow_node(&self, node_id: Uuid) -> Result<FlowNodeInstance, EngineError> {
        self.svc
            .store
            .get_flow_node(node_id)
            .await?
            .ok_or(EngineError::FlowNodeNotFound(node_id))
    }
}

/// Which node a failed work item should park, if any.
fn failed_node_scope(work: &WorkDescriptor) -> Option<Uuid> {
    match work {
        WorkDescriptor::ExecuteFlowNode { node_id, .. }
        | WorkDescriptor::FinishAsyncWork { node_id } => Some(*node_id),
        WorkDescriptor::NotifyChildFinished { child_id, .. } => Some(*child_id),
        WorkDescriptor::CompleteProcess { .. } | WorkDescriptor::MoveToFailed { .. } => None,
    }
}
