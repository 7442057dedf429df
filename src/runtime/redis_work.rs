use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::runtime::work::{WorkDescriptor, WorkQueue};

/// Redis-backed work queue for distributed workers. LPUSH on register,
/// blocking BRPOP with a short timeout on pop so workers stay responsive
/// to shutdown.
pub struct RedisWorkQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisWorkQueue {
    pub fn new(client: redis::Client, queue_key: String) -> Self {
        Self { client, queue_key }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn register_work(&self, work: WorkDescriptor) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&work)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<WorkDescriptor>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        if let Some((_, work_json)) = result {
            let work = serde_json::from_str(&work_json)?;
            Ok(Some(work))
        } else {
            Ok(None)
        }
    }
}
