use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::token::Token;

/// Token bookkeeping capability. Token creation always happens as part of a
/// gateway-merge decision; the ledger itself never invents tokens.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Mint `count` tokens sharing one `ref_id` (one per branch of a split).
    async fn create_tokens(
        &self,
        process_instance_id: Uuid,
        ref_id: Uuid,
        parent_ref_id: Option<Uuid>,
        count: usize,
    ) -> Result<()>;

    /// Retire `count` tokens of a ref family. Fails when fewer are alive.
    async fn consume_tokens(
        &self,
        process_instance_id: Uuid,
        ref_id: Uuid,
        count: usize,
    ) -> Result<()>;

    async fn get_token(&self, process_instance_id: Uuid, ref_id: Uuid) -> Result<Option<Token>>;

    /// Live tokens of a ref family. Drives the inclusive-gateway merge
    /// condition, so it must always reflect the just-updated state.
    async fn count_tokens(&self, process_instance_id: Uuid, ref_id: Uuid) -> Result<usize>;

    /// Drop every token of a finished process instance.
    async fn delete_all(&self, process_instance_id: Uuid) -> Result<()>;
}

pub struct InMemoryTokenLedger {
    tokens: DashMap<Uuid, Vec<Token>>,
}

impl InMemoryTokenLedger {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }
}

impl Default for InMemoryTokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenService for InMemoryTokenLedger {
    async fn create_tokens(
        &self,
        process_instance_id: Uuid,
        ref_id: Uuid,
        parent_ref_id: Option<Uuid>,
        count: usize,
    ) -> Result<()> {
        let mut entry = self.tokens.entry(process_instance_id).or_default();
        for _ in 0..count {
            entry.push(Token::new(process_instance_id, ref_id, parent_ref_id));
        }
        Ok(())
    }

    async fn consume_tokens(
        &self,
        process_instance_id: Uuid,
        ref_id: Uuid,
        count: usize,
    ) -> Result<()> {
        let mut entry = self
            .tokens
            .get_mut(&process_instance_id)
            .ok_or_else(|| anyhow::anyhow!("no tokens for process instance {}", process_instance_id))?;
        let alive = entry.iter().filter(|t| t.ref_id == ref_id).count();
        if alive < count {
            anyhow::bail!(
                "cannot consume {} tokens of ref {} ({} alive)",
                count,
                ref_id,
                alive
            );
        }
        let mut remaining = count;
        entry.retain(|t| {
            if remaining > 0 && t.ref_id == ref_id {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn get_token(&self, process_instance_id: Uuid, ref_id: Uuid) -> Result<Option<Token>> {
        Ok(self
            .tokens
            .get(&process_instance_id)
            .and_then(|v| v.iter().find(|t| t.ref_id == ref_id).cloned()))
    }

    async fn count_tokens(&self, process_instance_id: Uuid, ref_id: Uuid) -> Result<usize> {
        Ok(self
            .tokens
            .get(&process_instance_id)
            .map(|v| v.iter().filter(|t| t.ref_id == ref_id).count())
            .unwrap_or(0))
    }

    async fn delete_all(&self, process_instance_id: Uuid) -> Result<()> {
        self.tokens.remove(&process_instance_id);
        Ok(())
    }
}
