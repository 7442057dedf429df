use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::definition::NodeKind;

/// Which state sequence a node follows. An abort/cancel request flips the
/// category on the instance; the state manager then jumps to the head of the
/// exceptional sequence on the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Normal,
    Aborting,
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateId {
    Initializing,
    Ready,
    Waiting,
    Executing,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
    /// Operator-visible parking state reached through the recovery path,
    /// never through a state sequence.
    Failed,
}

impl StateId {
    pub fn name(self) -> &'static str {
        match self {
            StateId::Initializing => "initializing",
            StateId::Ready => "ready",
            StateId::Waiting => "waiting",
            StateId::Executing => "executing",
            StateId::Completing => "completing",
            StateId::Completed => "completed",
            StateId::Aborting => "aborting",
            StateId::Aborted => "aborted",
            StateId::Cancelling => "cancelling",
            StateId::Cancelled => "cancelled",
            StateId::Failed => "failed",
        }
    }

    pub fn category(self) -> StateCategory {
        match self {
            StateId::Aborting | StateId::Aborted => StateCategory::Aborting,
            StateId::Cancelling | StateId::Cancelled => StateCategory::Cancelling,
            _ => StateCategory::Normal,
        }
    }

    /// Stable states park the node until an external trigger re-enqueues it.
    pub fn is_stable(self) -> bool {
        matches!(self, StateId::Ready | StateId::Waiting | StateId::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StateId::Completed | StateId::Aborted | StateId::Cancelled)
    }
}

/// Identifies the container a flow node reports its completion to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerId {
    Process(Uuid),
    FlowNode(Uuid),
}

/// Runtime record of one node occurrence. Mutated exclusively through the
/// state manager's transition function; archived and deleted once terminal
/// and reported to its container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub id: Uuid,
    /// Definition node id; `None` for nodes added at runtime (e.g. inner
    /// instances of a multi-instance activity).
    pub definition_id: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    pub process_instance_id: Uuid,
    pub root_process_instance_id: Uuid,
    pub parent_container: ContainerId,
    pub state: StateId,
    pub category: StateCategory,
    /// Set while the current state's effect is asynchronous.
    pub executing: bool,
    /// Index of the next connector to run within the current state.
    pub connector_cursor: usize,
    /// Token justifying this instance.
    pub token_ref: Uuid,
    /// Child instances still awaited by this container node.
    pub token_count: usize,
    /// Transition ids that already hit this gateway instance.
    pub hit_bys: Vec<String>,
    /// Set once a satisfied gateway has been scheduled, so later arrivals
    /// open a fresh instance.
    pub fired: bool,
    /// For boundary events: the activity instance this event guards.
    pub related_activity_id: Option<Uuid>,
    pub executor_id: Option<u64>,
    pub substitute_executor_id: Option<u64>,
    /// State the node was in when the recovery path moved it to Failed.
    pub state_before_failure: Option<StateId>,
    pub reached_state_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl FlowNodeInstance {
    pub fn new(
        definition_id: Option<String>,
        name: String,
        kind: NodeKind,
        process_instance_id: Uuid,
        root_process_instance_id: Uuid,
        parent_container: ContainerId,
        initial_state: StateId,
        token_ref: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition_id,
            name,
            kind,
            process_instance_id,
            root_process_instance_id,
            parent_container,
            state: initial_state,
            category: StateCategory::Normal,
            executing: false,
            connector_cursor: 0,
            token_ref,
            token_count: 0,
            hit_bys: Vec::new(),
            fired: false,
            related_activity_id: None,
            executor_id: None,
            substitute_executor_id: None,
            state_before_failure: None,
            reached_state_at: now,
            last_update_at: now,
        }
    }

    /// Parked waiting for an external trigger, with no step in flight.
    pub fn is_stable(&self) -> bool {
        self.state.is_stable() && !self.executing
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Archived snapshot of a flow-node instance, taken before each mutation
/// step and readable after the live record is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedFlowNodeInstance {
    pub snapshot: FlowNodeInstance,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Started,
    Initializing,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Aborted | ProcessState::Cancelled
        )
    }
}

/// Root container of a running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub state: ProcessState,
    pub category: StateCategory,
    /// Call-activity instance that started this process, if nested.
    pub caller_id: Option<Uuid>,
    pub root_process_instance_id: Uuid,
    /// End event that aborted the sibling branches, if any.
    pub interrupting_event_id: Option<Uuid>,
    /// Index of the next process-level connector to run within the current
    /// state.
    pub connector_cursor: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(definition_id: String, caller_id: Option<Uuid>, root: Option<Uuid>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            definition_id,
            state: ProcessState::Started,
            category: StateCategory::Normal,
            caller_id,
            root_process_instance_id: root.unwrap_or(id),
            interrupting_event_id: None,
            connector_cursor: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}
