use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use procflow::connectors::{
    ConnectorContext, ConnectorHandler, ConnectorOutcome, ConnectorRegistry,
};
use procflow::loader;
use procflow::model::instance::{FlowNodeInstance, ProcessState, StateCategory, StateId};
use procflow::runtime::engine::Engine;

fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn deploy_and_run(
    engine: &Engine,
    yaml: &str,
    definition_id: &str,
    variables: HashMap<String, Value>,
) -> Uuid {
    engine.deploy(loader::from_yaml_str(yaml).unwrap());
    let pid = engine.start_process(definition_id, variables).await.unwrap();
    engine.run_until_idle().await;
    pid
}

async fn find_node(
    engine: &Engine,
    pid: Uuid,
    pred: impl Fn(&FlowNodeInstance) -> bool,
) -> FlowNodeInstance {
    engine
        .flow_nodes_of_process(pid)
        .await
        .unwrap()
        .into_iter()
        .find(|n| pred(n))
        .expect("expected a matching live flow node")
}

#[tokio::test]
async fn linear_process_runs_to_completion() {
    let yaml = r#"
id: shipping
name: Shipping
nodes:
  - id: start
    kind: { type: start_event }
  - id: ship
    name: Ship order
    kind: { type: automatic_task }
    on_finish_connectors:
      - id: c1
        name: set_variable
        params: { key: shipped, value: true }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: ship }
  - { id: t2, source: ship, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "shipping", HashMap::new()).await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert!(process.ended_at.is_some());
    assert_eq!(
        engine.get_variable(pid, "shipped").await.unwrap(),
        Some(json!(true))
    );
    assert!(engine.flow_nodes_of_process(pid).await.unwrap().is_empty());
}

#[tokio::test]
async fn initial_variables_merge_definition_defaults() {
    let yaml = r#"
id: defaults
nodes:
  - id: start
    kind: { type: start_event }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: done }
variables:
  region: "eu"
  retries: 3
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "defaults", vars(&[("retries", json!(5))])).await;

    assert_eq!(
        engine.get_variable(pid, "region").await.unwrap(),
        Some(json!("eu"))
    );
    // Caller-provided values win over definition defaults.
    assert_eq!(
        engine.get_variable(pid, "retries").await.unwrap(),
        Some(json!(5))
    );
}

#[tokio::test]
async fn human_task_parks_until_executed() {
    let yaml = r#"
id: review_flow
nodes:
  - id: start
    kind: { type: start_event }
  - id: review
    name: Review request
    kind: { type: human_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: review }
  - { id: t2, source: review, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "review_flow", HashMap::new()).await;

    let review = find_node(&engine, pid, |n| n.state == StateId::Ready).await;
    assert_eq!(review.definition_id.as_deref(), Some("review"));
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Started);

    engine.execute_human_task(review.id, 42, None).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    let archived = engine.archived_flow_node(review.id).await.unwrap().unwrap();
    assert_eq!(archived.snapshot.state, StateId::Completed);
    assert_eq!(archived.snapshot.executor_id, Some(42));
}

#[tokio::test]
async fn executing_a_task_that_is_not_ready_is_rejected() {
    let yaml = r#"
id: wait_flow
nodes:
  - id: start
    kind: { type: start_event }
  - id: wait
    kind: { type: intermediate_catch_event }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: wait }
  - { id: t2, source: wait, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "wait_flow", HashMap::new()).await;

    let wait = find_node(&engine, pid, |n| n.state == StateId::Waiting).await;
    assert!(engine.execute_human_task(wait.id, 1, None).await.is_err());

    engine.trigger_event(wait.id).await.unwrap();
    engine.run_until_idle().await;
    // Triggering the same node twice is a stale request.
    assert!(engine.trigger_event(wait.id).await.is_err());

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
}

#[tokio::test]
async fn multi_instance_activity_expands_its_collection() {
    let yaml = r#"
id: fanout
nodes:
  - id: start
    kind: { type: start_event }
  - id: each
    name: Per item
    kind: { type: multi_instance_activity, collection: items, item_variable: item }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: each }
  - { id: t2, source: each, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(
        &engine,
        yaml,
        "fanout",
        vars(&[("items", json!(["a", "b", "c"]))]),
    )
    .await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    for (index, expected) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(
            engine
                .get_variable(pid, &format!("item_{}", index))
                .await
                .unwrap(),
            Some(json!(expected))
        );
    }
}

#[tokio::test]
async fn multi_instance_activity_with_empty_collection_completes() {
    let yaml = r#"
id: fanout_empty
nodes:
  - id: start
    kind: { type: start_event }
  - id: each
    kind: { type: multi_instance_activity, collection: items, item_variable: item }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: each }
  - { id: t2, source: each, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "fanout_empty", HashMap::new()).await;
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
}

#[tokio::test]
async fn abort_interrupts_parked_work() {
    let yaml = r#"
id: abortable
nodes:
  - id: start
    kind: { type: start_event }
  - id: review
    kind: { type: human_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: review }
  - { id: t2, source: review, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "abortable", HashMap::new()).await;
    let review = find_node(&engine, pid, |n| n.state == StateId::Ready).await;

    engine.abort_process(pid).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Aborted);
    assert_eq!(process.category, StateCategory::Aborting);
    assert!(process.ended_at.is_some());
    let archived = engine.archived_flow_node(review.id).await.unwrap().unwrap();
    assert_eq!(archived.snapshot.state, StateId::Aborted);
}

#[tokio::test]
async fn cancel_walks_the_cancelling_sequence() {
    let yaml = r#"
id: cancellable
nodes:
  - id: start
    kind: { type: start_event }
  - id: review
    kind: { type: human_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: review }
  - { id: t2, source: review, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "cancellable", HashMap::new()).await;
    let review = find_node(&engine, pid, |n| n.state == StateId::Ready).await;

    engine.cancel_process(pid).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Cancelled);
    let archived = engine.archived_flow_node(review.id).await.unwrap().unwrap();
    assert_eq!(archived.snapshot.state, StateId::Cancelled);
}

// --- connector plumbing ---

/// Completes only from the second attempt on.
#[derive(Debug)]
struct FlakyConnector {
    failed_once: AtomicBool,
}

#[async_trait]
impl ConnectorHandler for FlakyConnector {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(
        &self,
        _params: &HashMap<String, Value>,
        _ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            anyhow::bail!("upstream unavailable");
        }
        Ok(ConnectorOutcome::Completed(Some(json!("ok"))))
    }
}

#[derive(Debug)]
struct ExternalConnector;

#[async_trait]
impl ConnectorHandler for ExternalConnector {
    fn name(&self) -> &str {
        "external"
    }

    async fn execute(
        &self,
        _params: &HashMap<String, Value>,
        _ctx: &ConnectorContext,
    ) -> Result<ConnectorOutcome> {
        Ok(ConnectorOutcome::Pending)
    }
}

#[tokio::test]
async fn pending_connector_suspends_until_notified() {
    let yaml = r#"
id: pending_flow
nodes:
  - id: start
    kind: { type: start_event }
  - id: call_out
    kind: { type: automatic_task }
    on_enter_connectors:
      - id: c1
        name: external
        output: reply
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: call_out }
  - { id: t2, source: call_out, target: done }
"#;
    let engine = Engine::in_memory_with_connectors(
        ConnectorRegistry::standard().with_handler(Arc::new(ExternalConnector)),
    );
    let pid = deploy_and_run(&engine, yaml, "pending_flow", HashMap::new()).await;

    let node = find_node(&engine, pid, |n| n.executing).await;
    assert_eq!(node.state, StateId::Initializing);
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Started);

    engine
        .notify_connector_completed(node.id, vars(&[("reply", json!({ "code": 200 }))]))
        .await
        .unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(
        engine.get_variable(pid, "reply").await.unwrap(),
        Some(json!({ "code": 200 }))
    );
}

#[tokio::test]
async fn aborting_a_process_parked_on_a_pending_process_connector() {
    let yaml = r#"
id: parked
on_enter_connectors:
  - id: pe1
    name: external
nodes:
  - id: start
    kind: { type: start_event }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: done }
"#;
    let engine = Engine::in_memory_with_connectors(
        ConnectorRegistry::standard().with_handler(Arc::new(ExternalConnector)),
    );
    let pid = deploy_and_run(&engine, yaml, "parked", HashMap::new()).await;

    // Suspended before any flow node exists: nothing will ever fold in.
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Initializing);
    assert!(engine.flow_nodes_of_process(pid).await.unwrap().is_empty());

    engine.abort_process(pid).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Aborted);
    assert!(process.ended_at.is_some());
}

#[tokio::test]
async fn failing_connector_parks_the_node_for_replay() {
    let yaml = r#"
id: flaky_flow
nodes:
  - id: start
    kind: { type: start_event }
  - id: fetch
    kind: { type: automatic_task }
    on_enter_connectors:
      - id: c1
        name: flaky
        output: fetched
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: fetch }
  - { id: t2, source: fetch, target: done }
"#;
    let engine = Engine::in_memory_with_connectors(
        ConnectorRegistry::standard().with_handler(Arc::new(FlakyConnector {
            failed_once: AtomicBool::new(false),
        })),
    );
    let pid = deploy_and_run(&engine, yaml, "flaky_flow", HashMap::new()).await;

    let failed = find_node(&engine, pid, |n| n.state == StateId::Failed).await;
    assert_eq!(failed.definition_id.as_deref(), Some("fetch"));
    assert_eq!(failed.state_before_failure, Some(StateId::Initializing));
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Started);

    engine.replay_flow_node(failed.id).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(
        engine.get_variable(pid, "fetched").await.unwrap(),
        Some(json!("ok"))
    );
}

#[tokio::test]
async fn replaying_a_healthy_node_is_rejected() {
    let yaml = r#"
id: healthy
nodes:
  - id: start
    kind: { type: start_event }
  - id: review
    kind: { type: human_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: review }
  - { id: t2, source: review, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "healthy", HashMap::new()).await;
    let review = find_node(&engine, pid, |n| n.state == StateId::Ready).await;
    assert!(engine.replay_flow_node(review.id).await.is_err());
}

#[tokio::test]
async fn process_level_connectors_bracket_the_run() {
    let yaml = r#"
id: bracketed
on_enter_connectors:
  - id: pe1
    name: set_variable
    params: { key: opened, value: true }
on_finish_connectors:
  - id: pf1
    name: set_variable
    params: { key: closed, value: true }
nodes:
  - id: start
    kind: { type: start_event }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: done }
"#;
    let engine = Engine::in_memory();
    let pid = deploy_and_run(&engine, yaml, "bracketed", HashMap::new()).await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(
        engine.get_variable(pid, "opened").await.unwrap(),
        Some(json!(true))
    );
    assert_eq!(
        engine.get_variable(pid, "closed").await.unwrap(),
        Some(json!(true))
    );
}
