use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::runtime::store::VariableStore;

pub mod http;

/// What a connector execution reported back.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorOutcome {
    /// The connector finished; the optional value is written to the
    /// connector's declared output variable.
    Completed(Option<Value>),
    /// The effect is asynchronous. The hosting engine resumes the node via
    /// `notify_connector_completed` once the external side finishes.
    Pending,
}

/// Execution-time context handed to connector handlers.
pub struct ConnectorContext {
    pub process_instance_id: Uuid,
    pub node_instance_id: Option<Uuid>,
    pub variables: Arc<dyn VariableStore>,
}

impl ConnectorContext {
    pub async fn get_var(&self, key: &str) -> Option<Value> {
        self.variables
            .get_var(self.process_instance_id, key)
            .await
            .ok()
            .flatten()
    }
}

/// Opaque connector behavior. Handlers are resolved by name from the
/// immutable [`ConnectorRegistry`] built at wiring time.
#[async_trait]
pub trait ConnectorHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, _params: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }
    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome>;
}

/// Name→handler mapping, constructed once and never mutated afterwards.
pub struct ConnectorRegistry {
    handlers: HashMap<String, Arc<dyn ConnectorHandler>>,
}

impl ConnectorRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the reference handlers: `log`, `set_variable`, `http`.
    pub fn standard() -> Self {
        Self::empty()
            .with_handler(Arc::new(LogConnector))
            .with_handler(Arc::new(SetVariableConnector))
            .with_handler(Arc::new(http::HttpConnector::new()))
    }

    pub fn with_handler(mut self, handler: Arc<dyn ConnectorHandler>) -> Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ConnectorHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[derive(Debug)]
pub struct LogConnector;

#[async_trait]
impl ConnectorHandler for LogConnector {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome> {
        if let Some(msg) = params.get("message").and_then(|v| v.as_str()) {
            info!(process_instance_id = %ctx.process_instance_id, "[connector:log] {}", msg);
        } else {
            info!(process_instance_id = %ctx.process_instance_id, "[connector:log] {:?}", params);
        }
        Ok(ConnectorOutcome::Completed(None))
    }
}

#[derive(Debug)]
pub struct SetVariableConnector;

#[async_trait]
impl ConnectorHandler for SetVariableConnector {
    fn name(&self) -> &str {
        "set_variable"
    }

    fn validate(&self, params: &HashMap<String, Value>) -> Result<()> {
        if params.get("key").and_then(|v| v.as_str()).is_none() {
            anyhow::bail!("missing required parameter: key");
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome> {
        let key = params
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: key"))?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        ctx.variables
            .set_var(ctx.process_instance_id, key, value)
            .await?;
        Ok(ConnectorOutcome::Completed(None))
    }
}
