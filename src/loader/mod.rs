//! YAML loading and structural validation of process definitions.

use std::collections::HashSet;
use std::path::Path;

use crate::error::EngineError;
use crate::model::definition::{GatewayKind, NodeKind, ProcessDefinition};

pub fn from_yaml_str(yaml: &str) -> Result<ProcessDefinition, EngineError> {
    let definition: ProcessDefinition =
        serde_yaml::from_str(yaml).map_err(|e| EngineError::DefinitionLoad(e.to_string()))?;
    validate(&definition)?;
    Ok(definition)
}

pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<ProcessDefinition, EngineError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        EngineError::DefinitionLoad(format!("{}: {}", path.as_ref().display(), e))
    })?;
    from_yaml_str(&content)
}

/// Structural checks a definition must pass before deployment. Execution
/// assumes all of these hold and treats violations found later as fatal.
pub fn validate(definition: &ProcessDefinition) -> Result<(), EngineError> {
    let fail = |message: String| EngineError::DefinitionInconsistency {
        process: definition.id.clone(),
        message,
    };

    if definition.id.is_empty() {
        return Err(fail("empty definition id".to_string()));
    }

    let mut node_ids = HashSet::new();
    for node in &definition.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(fail(format!("duplicate flow node id '{}'", node.id)));
        }
    }
    let mut transition_ids = HashSet::new();
    for transition in &definition.transitions {
        if !transition_ids.insert(transition.id.as_str()) {
            return Err(fail(format!("duplicate transition id '{}'", transition.id)));
        }
        if !node_ids.contains(transition.source.as_str()) {
            return Err(fail(format!(
                "transition '{}' references unknown source '{}'",
                transition.id, transition.source
            )));
        }
        if !node_ids.contains(transition.target.as_str()) {
            return Err(fail(format!(
                "transition '{}' references unknown target '{}'",
                transition.id, transition.target
            )));
        }
    }

    if definition.start_nodes().is_empty() {
        return Err(fail("no start node".to_string()));
    }

    for node in &definition.nodes {
        if let Some(default_id) = &node.default_transition {
            let default = definition
                .transitions
                .iter()
                .find(|t| &t.id == default_id)
                .ok_or_else(|| {
                    fail(format!(
                        "node '{}' declares unknown default transition '{}'",
                        node.id, default_id
                    ))
                })?;
            if default.source != node.id {
                return Err(fail(format!(
                    "default transition '{}' of node '{}' does not leave that node",
                    default_id, node.id
                )));
            }
            if default.guard.is_some() {
                return Err(fail(format!(
                    "default transition '{}' of node '{}' must not carry a guard",
                    default_id, node.id
                )));
            }
        }

        match &node.kind {
            NodeKind::BoundaryEvent { attached_to, .. } => {
                let activity = definition.flow_node(attached_to).map_err(|_| {
                    fail(format!(
                        "boundary event '{}' attached to unknown node '{}'",
                        node.id, attached_to
                    ))
                })?;
                if !activity.kind.accepts_boundary_events() {
                    return Err(fail(format!(
                        "boundary event '{}' attached to '{}', which takes no boundary events",
                        node.id, attached_to
                    )));
                }
                if !definition.incoming(&node.id).is_empty() {
                    return Err(fail(format!(
                        "boundary event '{}' must have no incoming transitions",
                        node.id
                    )));
                }
            }
            NodeKind::StartEvent => {
                if !definition.incoming(&node.id).is_empty() {
                    return Err(fail(format!(
                        "start event '{}' must have no incoming transitions",
                        node.id
                    )));
                }
            }
            NodeKind::EndEvent { .. } => {
                if !definition.outgoing(&node.id).is_empty() {
                    return Err(fail(format!(
                        "end event '{}' must have no outgoing transitions",
                        node.id
                    )));
                }
            }
            NodeKind::MultiInstanceActivity { collection, .. } => {
                if collection.is_empty() {
                    return Err(fail(format!(
                        "multi-instance activity '{}' declares no collection variable",
                        node.id
                    )));
                }
            }
            NodeKind::CallActivity { definition_id } => {
                if definition_id.is_empty() {
                    return Err(fail(format!(
                        "call activity '{}' declares no definition id",
                        node.id
                    )));
                }
            }
            // Parallel gateways take every branch unconditionally; a guard
            // on one of their outgoing transitions would silently never run.
            NodeKind::Gateway {
                kind: GatewayKind::Parallel,
            } => {
                if let Some(guarded) = definition
                    .outgoing(&node.id)
                    .into_iter()
                    .find(|t| t.guard.is_some())
                {
                    return Err(fail(format!(
                        "parallel gateway '{}' has a guarded outgoing transition '{}'",
                        node.id, guarded.id
                    )));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
id: order_shipping
name: Order shipping
nodes:
  - id: start
    kind: { type: start_event }
  - id: ship
    name: Ship order
    kind: { type: automatic_task }
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: ship }
  - { id: t2, source: ship, target: done }
variables:
  priority: 1
"#;

    #[test]
    fn parses_a_minimal_definition() {
        let definition = from_yaml_str(MINIMAL).unwrap();
        assert_eq!(definition.id, "order_shipping");
        assert_eq!(definition.nodes.len(), 3);
        assert_eq!(definition.transitions.len(), 2);
        assert_eq!(definition.start_nodes().len(), 1);
    }

    #[test]
    fn loads_a_definition_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order_shipping.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let definition = from_yaml_file(&path).unwrap();
        assert_eq!(definition.id, "order_shipping");

        let err = from_yaml_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionLoad(_)));
    }

    #[test]
    fn rejects_dangling_transitions() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
transitions:
  - { id: t1, source: start, target: nowhere }
"#;
        let err = from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionInconsistency { .. }));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
  - id: start
    kind: { type: end_event }
transitions: []
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_missing_start_node() {
        let yaml = r#"
id: broken
nodes:
  - id: only
    kind: { type: automatic_task }
transitions: []
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_boundary_event_on_non_activity() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
  - id: guard
    kind: { type: boundary_event, attached_to: start, interrupting: true }
transitions: []
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_guard_on_parallel_gateway_branch() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
  - id: fork
    kind: { type: gateway, kind: parallel }
  - id: a
    kind: { type: automatic_task }
  - id: b
    kind: { type: automatic_task }
transitions:
  - { id: t0, source: start, target: fork }
  - { id: t_a, source: fork, target: a, guard: "x > 1" }
  - { id: t_b, source: fork, target: b }
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_guarded_default_transition() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
  - id: route
    kind: { type: gateway, kind: exclusive }
    default_transition: t_d
  - id: a
    kind: { type: automatic_task }
transitions:
  - { id: t0, source: start, target: route }
  - { id: t_d, source: route, target: a, guard: "x > 1" }
"#;
        assert!(from_yaml_str(yaml).is_err());
    }

    #[test]
    fn rejects_foreign_default_transition() {
        let yaml = r#"
id: broken
nodes:
  - id: start
    kind: { type: start_event }
  - id: a
    kind: { type: automatic_task }
  - id: b
    kind: { type: automatic_task }
    default_transition: t1
  - id: done
    kind: { type: end_event }
transitions:
  - { id: t1, source: start, target: a }
  - { id: t2, source: b, target: done }
"#;
        assert!(from_yaml_str(yaml).is_err());
    }
}
