use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use procflow::loader;
use procflow::model::definition::NodeKind;
use procflow::model::instance::{FlowNodeInstance, ProcessState, StateId};
use procflow::runtime::engine::Engine;
use procflow::runtime::store::InstanceStore as _;

async fn deploy(engine: &Engine, yaml: &str) {
    engine.deploy(loader::from_yaml_str(yaml).unwrap());
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

const PARENT: &str = r#"
id: parent
nodes:
  - id: start
    kind: { type: start_event }
  - id: call
    name: Run approval
    kind: { type: call_activity, definition_id: child }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: call }
  - { id: t2, source: call, target: done }
"#;

const CHILD: &str = r#"
id: child
nodes:
  - id: start
    kind: { type: start_event }
  - id: approve
    name: Approve
    kind: { type: human_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: approve }
  - { id: t2, source: approve, target: done }
"#;

#[tokio::test]
async fn call_activity_suspends_on_its_child_process() {
    let engine = Engine::in_memory();
    deploy(&engine, PARENT).await;
    deploy(&engine, CHILD).await;

    let parent_pid = engine.start_process("parent", HashMap::new()).await.unwrap();
    engine.run_until_idle().await;

    let call = find_node(&engine, parent_pid, |n| {
        matches!(n.kind, NodeKind::CallActivity { .. })
    })
    .await;
    assert!(call.executing);

    let child = engine
        .services()
        .store
        .process_by_caller(call.id)
        .await
        .unwrap()
        .expect("child process should exist");
    assert_eq!(child.definition_id, "child");
    assert_eq!(child.state, ProcessState::Started);
    assert_eq!(child.caller_id, Some(call.id));
    assert_eq!(child.root_process_instance_id, parent_pid);

    let approve = find_node(&engine, child.id, |n| n.state == StateId::Ready).await;
    engine.execute_human_task(approve.id, 7, None).await.unwrap();
    engine.run_until_idle().await;

    let child = engine.process_instance(child.id).await.unwrap().unwrap();
    assert_eq!(child.state, ProcessState::Completed);
    let parent = engine.process_instance(parent_pid).await.unwrap().unwrap();
    assert_eq!(parent.state, ProcessState::Completed);
}

#[tokio::test]
async fn aborting_the_parent_cascades_into_the_child_process() {
    let engine = Engine::in_memory();
    deploy(&engine, PARENT).await;
    deploy(&engine, CHILD).await;

    let parent_pid = engine.start_process("parent", HashMap::new()).await.unwrap();
    engine.run_until_idle().await;
    let call = find_node(&engine, parent_pid, |n| {
        matches!(n.kind, NodeKind::CallActivity { .. })
    })
    .await;
    let child_pid = engine
        .services()
        .store
        .process_by_caller(call.id)
        .await
        .unwrap()
        .unwrap()
        .id;

    engine.abort_process(parent_pid).await.unwrap();
    engine.run_until_idle().await;

    let child = engine.process_instance(child_pid).await.unwrap().unwrap();
    assert_eq!(child.state, ProcessState::Aborted);
    let parent = engine.process_instance(parent_pid).await.unwrap().unwrap();
    assert_eq!(parent.state, ProcessState::Aborted);
}

#[tokio::test]
async fn terminating_end_event_aborts_sibling_branches() {
    let yaml = r#"
id: race
nodes:
  - id: start
    kind: { type: start_event }
  - id: fork
    kind: { type: gateway, kind: parallel }
  - id: stop
    kind: { type: end_event, terminating: true }
  - id: slow
    kind: { type: human_task }
  - id: slow_end
    kind: { type: end_event }
transitions:
  - { id: t0, source: start, target: fork }
  - { id: t_a, source: fork, target: stop }
  - { id: t_b, source: fork, target: slow }
  - { id: t_s, source: slow, target: slow_end }
"#;
    let engine = Engine::in_memory();
    deploy(&engine, yaml).await;
    let pid = engine.start_process("race", HashMap::new()).await.unwrap();
    engine.run_until_idle().await;

    // The terminating branch wins; the process itself still completes.
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert!(process.interrupting_event_id.is_some());
    assert!(engine.flow_nodes_of_process(pid).await.unwrap().is_empty());
}

const GUARDED: &str = r#"
id: guarded
nodes:
  - id: start
    kind: { type: start_event }
  - id: work
    name: Long work
    kind: { type: human_task }
  - id: escalate
    kind: { type: boundary_event, attached_to: work, interrupting: true }
  - id: esc_task
    kind: { type: automatic_task }
    on_finish_connectors:
      - id: c1
        name: set_variable
        params: { key: escalated, value: true }
  - id: remind
    kind: { type: boundary_event, attached_to: work, interrupting: false }
  - id: remind_task
    kind: { type: automatic_task }
    on_finish_connectors:
      - id: c2
        name: set_variable
        params: { key: reminded, value: true }
  - id: end_w
    kind: { type: end_event }
  - id: end_e
    kind: { type: end_event }
  - id: end_r
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: work }
  - { id: t2, source: work, target: end_w }
  - { id: t_e, source: escalate, target: esc_task }
  - { id: t_e2, source: esc_task, target: end_e }
  - { id: t_r, source: remind, target: remind_task }
  - { id: t_r2, source: remind_task, target: end_r }
"#;

#[tokio::test]
async fn interrupting_boundary_event_aborts_its_activity() {
    let engine = Engine::in_memory();
    deploy(&engine, GUARDED).await;
    let pid = engine.start_process("guarded", HashMap::new()).await.unwrap();
    engine.run_until_idle().await;

    let work = find_node(&engine, pid, |n| n.state == StateId::Ready).await;
    let escalate = find_node(&engine, pid, |n| {
        n.definition_id.as_deref() == Some("escalate")
    })
    .await;
    assert_eq!(escalate.state, StateId::Waiting);
    assert_eq!(escalate.related_activity_id, Some(work.id));

    engine.trigger_event(escalate.id).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(
        engine.get_variable(pid, "escalated").await.unwrap(),
        Some(json!(true))
    );
    let archived_work = engine.archived_flow_node(work.id).await.unwrap().unwrap();
    assert_eq!(archived_work.snapshot.state, StateId::Aborted);
}

#[tokio::test]
async fn non_interrupting_boundary_event_leaves_its_activity_running() {
    let engine = Engine::in_memory();
    deploy(&engine, GUARDED).await;
    let pid = engine.start_process("guarded", HashMap::new()).await.unwrap();
    engine.run_until_idle().await;

    let remind = find_node(&engine, pid, |n| {
        n.definition_id.as_deref() == Some("remind")
    })
    .await;
    engine.trigger_event(remind.id).await.unwrap();
    engine.run_until_idle().await;

    assert_eq!(
        engine.get_variable(pid, "reminded").await.unwrap(),
        Some(json!(true))
    );
    // The guarded task is untouched and still completes the process.
    let work = find_node(&engine, pid, |n| n.state == StateId::Ready).await;
    engine.execute_human_task(work.id, 3, None).await.unwrap();
    engine.run_until_idle().await;

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert_eq!(
        engine.get_variable(pid, "escalated").await.unwrap(),
        None
    );
}
