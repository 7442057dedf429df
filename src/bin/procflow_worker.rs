use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use procflow::connectors::ConnectorRegistry;
use procflow::loader;
use procflow::runtime::engine::Engine;
use procflow::runtime::redis_work::RedisWorkQueue;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process definition YAML files to deploy
    #[arg(long = "definition", required = true)]
    definitions: Vec<String>,

    /// Definition id to start an instance of; without it the worker only
    /// drains the queue
    #[arg(long)]
    start: Option<String>,

    /// Initial process variables as a JSON object
    #[arg(long, default_value = "{}")]
    vars: String,

    /// Redis connection URL for the distributed work queue; without it the
    /// worker runs on an in-memory queue
    #[arg(long)]
    redis: Option<String>,

    /// Redis list the work items live on
    #[arg(long, default_value = "procflow:work")]
    queue_key: String,

    /// Worker name (for logging)
    #[arg(long, default_value = "worker")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procflow=info".into()),
        )
        .init();

    let args = Args::parse();
    info!(name = %args.name, "worker starting");

    let engine = match &args.redis {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let queue = Arc::new(RedisWorkQueue::new(client, args.queue_key.clone()));
            Engine::with_queue(queue, ConnectorRegistry::standard())
        }
        None => Engine::in_memory(),
    };

    for path in &args.definitions {
        let definition = loader::from_yaml_file(path)?;
        engine.deploy(definition);
    }

    if let Some(definition_id) = &args.start {
        let variables: HashMap<String, Value> = serde_json::from_str(&args.vars)?;
        let process_instance_id = engine.start_process(definition_id, variables).await?;
        info!(process = %process_instance_id, definition = %definition_id, "process instance started");
    }

    info!(name = %args.name, "ready, draining work");
    engine.run_worker().await;

    Ok(())
}
