use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::connectors::{ConnectorContext, ConnectorHandler, ConnectorOutcome};

/// Reference HTTP connector. Writes `{ "status": u16, "ok": bool,
/// "body": <json> }` to its output variable; a non-JSON response body is
/// reported as `null`.
#[derive(Debug)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorHandler for HttpConnector {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, params: &HashMap<String, Value>) -> Result<()> {
        match params.get("url") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(anyhow!("http connector needs a string 'url' parameter")),
        }
    }

    async fn execute(
        &self,
        params: &HashMap<String, Value>,
        _ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("http connector needs a string 'url' parameter"))?;
        let method = match params.get("method").and_then(|v| v.as_str()) {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| anyhow!("unsupported HTTP method '{}'", m))?,
        };

        let mut request = self.client.request(method, url);
        if let Some(Value::Object(headers)) = params.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = params.get("body") {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        Ok(ConnectorOutcome::Completed(Some(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "body": body,
        }))))
    }
}
