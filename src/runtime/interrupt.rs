use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::definition::NodeKind;
use crate::model::instance::{ContainerId, FlowNodeInstance, ProcessState, StateCategory};
use crate::runtime::RuntimeServices;
use crate::runtime::store::InstanceStore as _;
use crate::runtime::work::{WorkDescriptor, WorkQueue as _};

/// Children are re-queried in batches of this size: concurrent execution
/// may create new children between batches.
const INTERRUPT_BATCH: usize = 20;

/// Propagates abort/cancel requests down a process instance or a flow-node
/// subtree until no descendants remain in the normal category.
pub struct Interruptor {
    svc: Arc<RuntimeServices>,
}

impl Interruptor {
    pub fn new(svc: Arc<RuntimeServices>) -> Self {
        Self { svc }
    }

    /// Aborts or cancels a whole process instance.
    pub async fn interrupt_process_instance(
        &self,
        process_instance_id: Uuid,
        category: StateCategory,
        interrupting_event_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let process_state = match category {
            StateCategory::Aborting => ProcessState::Aborting,
            StateCategory::Cancelling => ProcessState::Cancelling,
            StateCategory::Normal => return Ok(()),
        };

        let _guard = self.svc.locks.acquire(process_instance_id).await;
        self.svc
            .store
            .set_process_category(process_instance_id, category)
            .await?;
        self.svc
            .store
            .set_process_state(process_instance_id, process_state)
            .await?;
        if let Some(event_id) = interrupting_event_id {
            self.svc
                .store
                .set_interrupting_event(process_instance_id, event_id)
                .await?;
        }
        self.interrupt_children(&ContainerId::Process(process_instance_id), category, None)
            .await?;
        // Completion is normally driven by the last child folding in. A
        // process with no live children (e.g. parked on a pending
        // process-level connector) has nobody left to drive it, so the
        // completion check gets its own unit of work.
        self.svc
            .queue
            .register_work(WorkDescriptor::CompleteProcess {
                process_instance_id,
            })
            .await?;
        Ok(())
    }

    /// Aborts every sibling branch of a process instance except the given
    /// node (a terminating end event). The process itself stays in the
    /// normal category and completes through the surviving branch.
    pub async fn interrupt_siblings(
        &self,
        process_instance_id: Uuid,
        except: Uuid,
        category: StateCategory,
    ) -> Result<(), EngineError> {
        let _guard = self.svc.locks.acquire(process_instance_id).await;
        self.interrupt_children(
            &ContainerId::Process(process_instance_id),
            category,
            Some(except),
        )
        .await
    }

    /// Interrupts one flow-node instance and, transitively, everything it
    /// contains.
    pub async fn interrupt_flow_node_instance_and_children(
        &self,
        node_id: Uuid,
        category: StateCategory,
    ) -> Result<(), EngineError> {
        let Some(instance) = self.svc.store.get_flow_node(node_id).await? else {
            return Ok(());
        };
        if instance.is_terminal() || instance.category != StateCategory::Normal {
            return Ok(());
        }
        self.interrupt_flow_node_instance(&instance, category).await
    }

    /// Interrupts the direct children of a container flow node. Loops in
    /// batches until no normal-category children remain.
    pub async fn interrupt_children_of_flow_node_instance(
        &self,
        parent_id: Uuid,
        category: StateCategory,
    ) -> Result<(), EngineError> {
        self.interrupt_children(&ContainerId::FlowNode(parent_id), category, None)
            .await
    }

    async fn interrupt_children(
        &self,
        container: &ContainerId,
        category: StateCategory,
        except: Option<Uuid>,
    ) -> Result<(), EngineError> {
        loop {
            let batch = self
                .svc
                .store
                .children_in_category(container, StateCategory::Normal, 0, INTERRUPT_BATCH)
                .await?;
            let batch: Vec<FlowNodeInstance> = batch
                .into_iter()
                .filter(|c| Some(c.id) != except)
                .collect();
            if batch.is_empty() {
                return Ok(());
            }
            for child in batch {
                // A straggler must not block the cascade; the loop keeps
                // draining the rest.
                if let Err(e) = self.interrupt_flow_node_instance(&child, category).await {
                    warn!(child = %child.id, error = %e, "failed to interrupt child, continuing cascade");
                }
            }
        }
    }

    async fn interrupt_flow_node_instance(
        &self,
        instance: &FlowNodeInstance,
        category: StateCategory,
    ) -> Result<(), EngineError> {
        self.svc.store.set_category(instance.id, category).await?;
        debug!(
            flow_node = %instance.id,
            name = %instance.name,
            ?category,
            "flow node category changed"
        );

        match &instance.kind {
            // Container activities are not re-executed directly: their
            // inner instances are the ones that must individually abort.
            NodeKind::CallActivity { .. } => {
                if let Some(child_process) = self.svc.store.process_by_caller(instance.id).await? {
                    if !child_process.state.is_terminal() {
                        Box::pin(self.interrupt_process_instance(
                            child_process.id,
                            category,
                            None,
                        ))
                        .await?;
                    }
                }
            }
            NodeKind::MultiInstanceActivity { .. } => {
                Box::pin(self.interrupt_children(
                    &ContainerId::FlowNode(instance.id),
                    category,
                    None,
                ))
                .await?;
            }
            _ => {
                // A node with no step in flight (parked human task, waiting
                // event, unfired gateway) will not progress on its own:
                // re-enqueue it so it walks its exceptional state sequence.
                // Nodes suspended on asynchronous work resume through their
                // normal completion path and jump sequences there.
                if !instance.executing {
                    self.svc
                        .queue
                        .register_work(WorkDescriptor::ExecuteFlowNode {
                            node_id: instance.id,
                            executor_id: None,
                            substitute_executor_id: None,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectorRegistry;
    use crate::expr::EvalexprEvaluator;
    use crate::model::instance::{ProcessInstance, StateId};
    use crate::runtime::ledger::InMemoryTokenLedger;
    use crate::runtime::lock::LockRegistry;
    use crate::runtime::states::StateRegistry;
    use crate::runtime::store::{InMemoryInstanceStore, InMemoryVariableStore, InstanceStore};
    use crate::runtime::work::{InMemoryWorkQueue, WorkQueue};
    use crate::runtime::{DefinitionRegistry, RuntimeServices};

    fn services() -> Arc<RuntimeServices> {
        Arc::new(RuntimeServices {
            definitions: Arc::new(DefinitionRegistry::new()),
            store: Arc::new(InMemoryInstanceStore::new()),
            variables: Arc::new(InMemoryVariableStore::new()),
            tokens: Arc::new(InMemoryTokenLedger::new()),
            expressions: Arc::new(EvalexprEvaluator),
            connectors: Arc::new(ConnectorRegistry::empty()),
            queue: Arc::new(InMemoryWorkQueue::new(64)),
            locks: LockRegistry::new(),
            states: Arc::new(StateRegistry::bootstrap()),
        })
    }

    fn node(pid: Uuid, state: StateId) -> FlowNodeInstance {
        FlowNodeInstance::new(
            None,
            "n".to_string(),
            crate::model::definition::NodeKind::AutomaticTask,
            pid,
            pid,
            ContainerId::Process(pid),
            state,
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn flips_only_normal_children_and_requeues_idle_ones() {
        let svc = services();
        let process = ProcessInstance::new("p".to_string(), None, None);
        let pid = process.id;
        svc.store.create_process(process).await.unwrap();

        let parked = node(pid, StateId::Ready);
        let queued = node(pid, StateId::Initializing);
        let mut suspended = node(pid, StateId::Executing);
        suspended.executing = true;
        let finished = node(pid, StateId::Completed);
        let ids = [parked.id, queued.id, suspended.id, finished.id];
        for n in [parked, queued, suspended.clone(), finished] {
            svc.store.create_flow_node(n).await.unwrap();
        }

        Interruptor::new(svc.clone())
            .interrupt_process_instance(pid, StateCategory::Aborting, None)
            .await
            .unwrap();

        let process = svc.store.get_process(pid).await.unwrap().unwrap();
        assert_eq!(process.state, ProcessState::Aborting);
        assert_eq!(process.category, StateCategory::Aborting);

        // Three non-terminal children flipped; the terminal one is untouched.
        for (index, id) in ids.iter().enumerate() {
            let n = svc.store.get_flow_node(*id).await.unwrap().unwrap();
            let expected = if index < 3 {
                StateCategory::Aborting
            } else {
                StateCategory::Normal
            };
            assert_eq!(n.category, expected);
        }

        // Only the two children with no step in flight got re-enqueued, plus
        // one completion check for the process itself.
        let mut requeued = Vec::new();
        let mut completions = 0;
        while let Ok(Some(work)) = svc.queue.pop().await {
            match work {
                WorkDescriptor::ExecuteFlowNode { node_id, .. } => requeued.push(node_id),
                WorkDescriptor::CompleteProcess {
                    process_instance_id,
                } => {
                    assert_eq!(process_instance_id, pid);
                    completions += 1;
                }
                other => panic!("unexpected work item {:?}", other),
            }
        }
        assert_eq!(requeued.len(), 2);
        assert_eq!(completions, 1);
        assert!(requeued.contains(&ids[0]));
        assert!(requeued.contains(&ids[1]));
        assert!(!requeued.contains(&suspended.id));
    }
}
