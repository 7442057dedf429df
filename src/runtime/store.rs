use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::definition::NodeKind;
use crate::model::instance::{
    ArchivedFlowNodeInstance, ContainerId, FlowNodeInstance, ProcessInstance, ProcessState,
    StateCategory, StateId,
};

/// Persistence capability for flow-node and process-instance records.
///
/// The hosting engine is expected to back this with a conflict-detecting
/// store; this core assumes every mutation is atomic. The in-memory
/// implementation below is the reference used by the worker binary and the
/// tests.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create_flow_node(&self, instance: FlowNodeInstance) -> Result<()>;
    async fn get_flow_node(&self, id: Uuid) -> Result<Option<FlowNodeInstance>>;
    async fn delete_flow_node(&self, id: Uuid) -> Result<()>;

    /// Persist a state transition. Clears the executing flag, resets the
    /// connector cursor and stamps the state timestamps.
    async fn set_state(&self, id: Uuid, state: StateId) -> Result<()>;
    async fn set_executing(&self, id: Uuid, executing: bool) -> Result<()>;
    async fn set_category(&self, id: Uuid, category: StateCategory) -> Result<()>;
    async fn set_token_count(&self, id: Uuid, count: usize) -> Result<()>;
    async fn set_connector_cursor(&self, id: Uuid, cursor: usize) -> Result<()>;
    async fn set_executor_ids(
        &self,
        id: Uuid,
        executor_id: Option<u64>,
        substitute_executor_id: Option<u64>,
    ) -> Result<()>;
    async fn set_state_before_failure(&self, id: Uuid, state: Option<StateId>) -> Result<()>;

    /// Record a transition hit on a gateway instance and return the updated
    /// hit list.
    async fn add_gateway_hit(&self, id: Uuid, transition_id: &str) -> Result<Vec<String>>;
    /// Mark a satisfied gateway as scheduled so later arrivals open a fresh
    /// instance.
    async fn mark_gateway_fired(&self, id: Uuid) -> Result<()>;

    async fn archive_flow_node(&self, instance: &FlowNodeInstance) -> Result<()>;
    /// Latest archived snapshot, readable after the live record is deleted.
    async fn get_archived_flow_node(&self, id: Uuid) -> Result<Option<ArchivedFlowNodeInstance>>;

    /// Live direct children of a container, paginated, oldest first.
    async fn children_of(
        &self,
        container: &ContainerId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FlowNodeInstance>>;
    /// Live direct children still in the given category and not terminal.
    async fn children_in_category(
        &self,
        container: &ContainerId,
        category: StateCategory,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FlowNodeInstance>>;
    /// Number of live flow-node records in a process instance.
    async fn count_flow_nodes_in_process(&self, process_instance_id: Uuid) -> Result<usize>;

    /// Unfired, non-terminal gateway instance for a definition node and
    /// token ref, if one is currently accumulating hits.
    async fn find_active_gateway(
        &self,
        process_instance_id: Uuid,
        definition_id: &str,
        token_ref: Uuid,
    ) -> Result<Option<FlowNodeInstance>>;
    /// All unfired, non-terminal gateway instances of a process instance.
    async fn active_gateways(&self, process_instance_id: Uuid) -> Result<Vec<FlowNodeInstance>>;
    /// Live boundary-event instances guarding the given activity instance.
    async fn boundary_events_of_activity(
        &self,
        activity_instance_id: Uuid,
    ) -> Result<Vec<FlowNodeInstance>>;

    async fn create_process(&self, instance: ProcessInstance) -> Result<()>;
    async fn get_process(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    /// Persist a process state transition. Resets the process-level
    /// connector cursor and stamps `ended_at` on terminal states.
    async fn set_process_state(&self, id: Uuid, state: ProcessState) -> Result<()>;
    async fn set_process_category(&self, id: Uuid, category: StateCategory) -> Result<()>;
    async fn set_process_connector_cursor(&self, id: Uuid, cursor: usize) -> Result<()>;
    async fn set_interrupting_event(&self, id: Uuid, event_id: Uuid) -> Result<()>;
    async fn archive_process(&self, instance: &ProcessInstance) -> Result<()>;
    /// Child process instance started by the given call-activity instance.
    async fn process_by_caller(&self, caller_id: Uuid) -> Result<Option<ProcessInstance>>;
}

/// Process-variable capability, scoped per process instance.
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn init_instance(
        &self,
        process_instance_id: Uuid,
        initial: HashMap<String, Value>,
    ) -> Result<()>;
    async fn get_var(&self, process_instance_id: Uuid, key: &str) -> Result<Option<Value>>;
    async fn set_var(&self, process_instance_id: Uuid, key: &str, value: Value) -> Result<()>;
    /// All variables of an instance, for guard evaluation.
    async fn get_all_vars(&self, process_instance_id: Uuid) -> Result<HashMap<String, Value>>;
}

// --- In-memory implementations ---

pub struct InMemoryInstanceStore {
    flow_nodes: DashMap<Uuid, FlowNodeInstance>,
    archived: DashMap<Uuid, Vec<ArchivedFlowNodeInstance>>,
    processes: DashMap<Uuid, ProcessInstance>,
    archived_processes: DashMap<Uuid, Vec<ProcessInstance>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            flow_nodes: DashMap::new(),
            archived: DashMap::new(),
            processes: DashMap::new(),
            archived_processes: DashMap::new(),
        }
    }

    fn with_node<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut FlowNodeInstance) -> R,
    ) -> Result<R> {
        let mut entry = self
            .flow_nodes
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("flow node instance {} not found", id))?;
        entry.last_update_at = Utc::now();
        Ok(f(&mut entry))
    }

    fn with_process<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ProcessInstance) -> R,
    ) -> Result<R> {
        let mut entry = self
            .processes
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("process instance {} not found", id))?;
        Ok(f(&mut entry))
    }

    fn sorted_children(&self, container: &ContainerId) -> Vec<FlowNodeInstance> {
        let mut children: Vec<FlowNodeInstance> = self
            .flow_nodes
            .iter()
            .filter(|e| e.value().parent_container == *container)
            .map(|e| e.value().clone())
            .collect();
        children.sort_by(|a, b| {
            a.reached_state_at
                .cmp(&b.reached_state_at)
                .then(a.id.cmp(&b.id))
        });
        children
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create_flow_node(&self, instance: FlowNodeInstance) -> Result<()> {
        self.flow_nodes.insert(instance.id, instance);
        Ok(())
    }

    async fn get_flow_node(&self, id: Uuid) -> Result<Option<FlowNodeInstance>> {
        Ok(self.flow_nodes.get(&id).map(|e| e.value().clone()))
    }

    async fn delete_flow_node(&self, id: Uuid) -> Result<()> {
        self.flow_nodes.remove(&id);
        Ok(())
    }

    async fn set_state(&self, id: Uuid, state: StateId) -> Result<()> {
        self.with_node(id, |n| {
            n.state = state;
            n.executing = false;
            n.connector_cursor = 0;
            n.reached_state_at = Utc::now();
        })
    }

    async fn set_executing(&self, id: Uuid, executing: bool) -> Result<()> {
        self.with_node(id, |n| n.executing = executing)
    }

    async fn set_category(&self, id: Uuid, category: StateCategory) -> Result<()> {
        self.with_node(id, |n| n.category = category)
    }

    async fn set_token_count(&self, id: Uuid, count: usize) -> Result<()> {
        self.with_node(id, |n| n.token_count = count)
    }

    async fn set_connector_cursor(&self, id: Uuid, cursor: usize) -> Result<()> {
        self.with_node(id, |n| n.connector_cursor = cursor)
    }

    async fn set_executor_ids(
        &self,
        id: Uuid,
        executor_id: Option<u64>,
        substitute_executor_id: Option<u64>,
    ) -> Result<()> {
        self.with_node(id, |n| {
            if executor_id.is_some() {
                n.executor_id = executor_id;
            }
            if substitute_executor_id.is_some() {
                n.substitute_executor_id = substitute_executor_id;
            }
        })
    }

    async fn set_state_before_failure(&self, id: Uuid, state: Option<StateId>) -> Result<()> {
        self.with_node(id, |n| n.state_before_failure = state)
    }

    async fn add_gateway_hit(&self, id: Uuid, transition_id: &str) -> Result<Vec<String>> {
        self.with_node(id, |n| {
            if !n.hit_bys.iter().any(|t| t == transition_id) {
                n.hit_bys.push(transition_id.to_string());
            }
            n.hit_bys.clone()
        })
    }

    async fn mark_gateway_fired(&self, id: Uuid) -> Result<()> {
        self.with_node(id, |n| n.fired = true)
    }

    async fn archive_flow_node(&self, instance: &FlowNodeInstance) -> Result<()> {
        self.archived
            .entry(instance.id)
            .or_default()
            .push(ArchivedFlowNodeInstance {
                snapshot: instance.clone(),
                archived_at: Utc::now(),
            });
        Ok(())
    }

    async fn get_archived_flow_node(
        &self,
        id: Uuid,
    ) -> Result<Option<ArchivedFlowNodeInstance>> {
        Ok(self
            .archived
            .get(&id)
            .and_then(|v| v.value().last().cloned()))
    }

    async fn children_of(
        &self,
        container: &ContainerId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .sorted_children(container)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn children_in_category(
        &self,
        container: &ContainerId,
        category: StateCategory,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .sorted_children(container)
            .into_iter()
            .filter(|n| n.category == category && !n.is_terminal())
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn count_flow_nodes_in_process(&self, process_instance_id: Uuid) -> Result<usize> {
        Ok(self
            .flow_nodes
            .iter()
            .filter(|e| e.value().process_instance_id == process_instance_id)
            .count())
    }

    async fn find_active_gateway(
        &self,
        process_instance_id: Uuid,
        definition_id: &str,
        token_ref: Uuid,
    ) -> Result<Option<FlowNodeInstance>> {
        Ok(self
            .flow_nodes
            .iter()
            .map(|e| e.value().clone())
            .find(|n| {
                n.process_instance_id == process_instance_id
                    && n.definition_id.as_deref() == Some(definition_id)
                    && n.token_ref == token_ref
                    && matches!(n.kind, NodeKind::Gateway { .. })
                    && !n.fired
                    && !n.is_terminal()
            }))
    }

    async fn active_gateways(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .flow_nodes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| {
                n.process_instance_id == process_instance_id
                    && matches!(n.kind, NodeKind::Gateway { .. })
                    && !n.fired
                    && !n.is_terminal()
            })
            .collect())
    }

    async fn boundary_events_of_activity(
        &self,
        activity_instance_id: Uuid,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .flow_nodes
            .iter()
            .map(|e| e.value().clone())
            .filter(|n| n.related_activity_id == Some(activity_instance_id))
            .collect())
    }

    async fn create_process(&self, instance: ProcessInstance) -> Result<()> {
        self.processes.insert(instance.id, instance);
        Ok(())
    }

    async fn get_process(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.processes.get(&id).map(|e| e.value().clone()))
    }

    async fn set_process_state(&self, id: Uuid, state: ProcessState) -> Result<()> {
        self.with_process(id, |p| {
            p.state = state;
            p.connector_cursor = 0;
            if state.is_terminal() {
                p.ended_at = Some(Utc::now());
            }
        })
    }

    async fn set_process_category(&self, id: Uuid, category: StateCategory) -> Result<()> {
        self.with_process(id, |p| p.category = category)
    }

    async fn set_process_connector_cursor(&self, id: Uuid, cursor: usize) -> Result<()> {
        self.with_process(id, |p| p.connector_cursor = cursor)
    }

    async fn set_interrupting_event(&self, id: Uuid, event_id: Uuid) -> Result<()> {
        self.with_process(id, |p| p.interrupting_event_id = Some(event_id))
    }

    async fn archive_process(&self, instance: &ProcessInstance) -> Result<()> {
        self.archived_processes
            .entry(instance.id)
            .or_default()
            .push(instance.clone());
        Ok(())
    }

    async fn process_by_caller(&self, caller_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self
            .processes
            .iter()
            .map(|e| e.value().clone())
            .find(|p| p.caller_id == Some(caller_id)))
    }
}

pub struct InMemoryVariableStore {
    vars: DashMap<Uuid, DashMap<String, Value>>,
}

impl InMemoryVariableStore {
    pub fn new() -> Self {
        Self {
            vars: DashMap::new(),
        }
    }
}

impl Default for InMemoryVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn init_instance(
        &self,
        process_instance_id: Uuid,
        initial: HashMap<String, Value>,
    ) -> Result<()> {
        let instance_vars = DashMap::new();
        for (k, v) in initial {
            instance_vars.insert(k, v);
        }
        self.vars.insert(process_instance_id, instance_vars);
        Ok(())
    }

    async fn get_var(&self, process_instance_id: Uuid, key: &str) -> Result<Option<Value>> {
        if let Some(inst_vars) = self.vars.get(&process_instance_id) {
            Ok(inst_vars.get(key).map(|v| v.value().clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_var(&self, process_instance_id: Uuid, key: &str, value: Value) -> Result<()> {
        let inst_vars = self
            .vars
            .entry(process_instance_id)
            .or_insert_with(DashMap::new);
        inst_vars.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_all_vars(&self, process_instance_id: Uuid) -> Result<HashMap<String, Value>> {
        if let Some(inst_vars) = self.vars.get(&process_instance_id) {
            let mut map = HashMap::new();
            for item in inst_vars.iter() {
                map.insert(item.key().clone(), item.value().clone());
            }
            Ok(map)
        } else {
            Ok(HashMap::new())
        }
    }
}
