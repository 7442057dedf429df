use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::model::instance::ContainerId;

/// One unit of asynchronous work. Descriptors are serializable so remote
/// queue implementations can carry them across processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkDescriptor {
    /// Advance a flow node by one state-execution step.
    ExecuteFlowNode {
        node_id: Uuid,
        executor_id: Option<u64>,
        substitute_executor_id: Option<u64>,
    },
    /// A child reached a terminal state; its container must react.
    NotifyChildFinished {
        process_definition_id: String,
        container: ContainerId,
        child_id: Uuid,
    },
    /// An asynchronous state effect (connector, child process) completed;
    /// move the node past its current state.
    FinishAsyncWork { node_id: Uuid },
    /// Resume a deferred process completion (asynchronous on-finish work).
    CompleteProcess { process_instance_id: Uuid },
    /// Recovery path: park a node in the Failed state in its own unit of
    /// work, so it survives the failing step.
    MoveToFailed { node_id: Uuid, reason: String },
}

/// Fire-and-forget work registration plus the worker-side pop.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn register_work(&self, work: WorkDescriptor) -> Result<()>;
    /// Next unit of work, or `None` when the queue stayed idle for the
    /// implementation's poll interval.
    async fn pop(&self) -> Result<Option<WorkDescriptor>>;
}

pub struct InMemoryWorkQueue {
    sender: mpsc::Sender<WorkDescriptor>,
    receiver: Mutex<mpsc::Receiver<WorkDescriptor>>,
    idle_poll: Duration,
}

impl InMemoryWorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: tx,
            receiver: Mutex::new(rx),
            idle_poll: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn register_work(&self, work: WorkDescriptor) -> Result<()> {
        self.sender
            .send(work)
            .await
            .map_err(|e| anyhow::anyhow!("work channel closed: {}", e))
    }

    async fn pop(&self) -> Result<Option<WorkDescriptor>> {
        let mut rx = self.receiver.lock().await;
        match tokio::time::timeout(self.idle_poll, rx.recv()).await {
            Ok(work) => Ok(work),
            Err(_) => Ok(None),
        }
    }
}
