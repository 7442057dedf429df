use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::definition::{FlowNodeDef, GatewayKind, NodeKind};
use crate::model::instance::FlowNodeInstance;
use crate::model::token::Token;
use crate::runtime::RuntimeServices;
use crate::runtime::ledger::TokenService as _;
use crate::runtime::transitions::TransitionsWrapper;

/// Transient token-bookkeeping decision for one finished node. Computed
/// fresh on every hit and never cached: token state changes between hits.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMergeDescriptor {
    pub consume_input_token: bool,
    pub create_token: bool,
    /// The branch ends here without merge bookkeeping.
    pub implicit_end: bool,
    /// Ref id cited by the nodes created after this one.
    pub output_token_ref: Option<Uuid>,
    /// Parent ref id of tokens minted for this node's outputs.
    pub output_parent_token_ref: Option<Uuid>,
}

impl GatewayMergeDescriptor {
    fn transmit(token_ref: Uuid) -> Self {
        Self {
            consume_input_token: false,
            create_token: false,
            implicit_end: false,
            output_token_ref: Some(token_ref),
            output_parent_token_ref: None,
        }
    }

    fn implicit_end() -> Self {
        Self {
            consume_input_token: false,
            create_token: false,
            implicit_end: true,
            output_token_ref: None,
            output_parent_token_ref: None,
        }
    }
}

/// Decides token consumption/creation when a node feeding (or being) a
/// gateway finishes. Must be invoked with the authoritative, just-updated
/// token state: it queries the token service mid-calculation.
pub struct MergeCalculator {
    svc: Arc<RuntimeServices>,
}

impl MergeCalculator {
    pub fn new(svc: Arc<RuntimeServices>) -> Self {
        Self { svc }
    }

    async fn current_token(&self, instance: &FlowNodeInstance) -> Result<Token, EngineError> {
        self.svc
            .tokens
            .get_token(instance.process_instance_id, instance.token_ref)
            .await?
            .ok_or(EngineError::TokenNotFound {
                process_instance_id: instance.process_instance_id,
                ref_id: instance.token_ref,
            })
    }

    pub async fn compute(
        &self,
        node_def: Option<&FlowNodeDef>,
        instance: &FlowNodeInstance,
        wrapper: &TransitionsWrapper,
    ) -> Result<GatewayMergeDescriptor, EngineError> {
        // Nodes added at runtime are not part of the graph: no merge or
        // split applies to them.
        let Some(node) = node_def else {
            return Ok(GatewayMergeDescriptor::transmit(instance.token_ref));
        };

        if wrapper.all_outgoing.is_empty() {
            return Ok(GatewayMergeDescriptor::implicit_end());
        }

        match &node.kind {
            NodeKind::Gateway {
                kind: GatewayKind::Exclusive,
            } => Ok(GatewayMergeDescriptor::transmit(instance.token_ref)),

            NodeKind::Gateway { .. } => {
                self.compute_parallel_or_inclusive(instance, wrapper).await
            }

            NodeKind::BoundaryEvent { interrupting, .. } => {
                if *interrupting {
                    // Re-use the token that activated the now-cancelled
                    // activity, so the cancelled branch's token is retired
                    // downstream.
                    Ok(GatewayMergeDescriptor::transmit(instance.token_ref))
                } else {
                    // A non-interrupting boundary event runs a disjoint
                    // branch on a parentless token.
                    Ok(GatewayMergeDescriptor {
                        consume_input_token: false,
                        create_token: true,
                        implicit_end: false,
                        output_token_ref: Some(Uuid::new_v4()),
                        output_parent_token_ref: None,
                    })
                }
            }

            _ => Ok(GatewayMergeDescriptor::transmit(instance.token_ref)),
        }
    }

    /// Decision table over (declared incoming, declared outgoing) for
    /// parallel and inclusive gateways.
    async fn compute_parallel_or_inclusive(
        &self,
        instance: &FlowNodeInstance,
        wrapper: &TransitionsWrapper,
    ) -> Result<GatewayMergeDescriptor, EngineError> {
        let merges = wrapper.input_count > 1;
        let splits = wrapper.all_outgoing.len() > 1;

        match (merges, splits) {
            (false, false) => Ok(GatewayMergeDescriptor::transmit(instance.token_ref)),

            // Split: mint a child token family parented to the current one.
            (false, true) => Ok(GatewayMergeDescriptor {
                consume_input_token: false,
                create_token: true,
                implicit_end: false,
                output_token_ref: Some(Uuid::new_v4()),
                output_parent_token_ref: Some(instance.token_ref),
            }),

            // Merge: consume the arrived family, collapse to its parent.
            (true, false) => {
                let token = self.current_token(instance).await?;
                let output_ref = token.parent_ref_id.unwrap_or(instance.token_ref);
                let output_parent = match token.parent_ref_id {
                    Some(parent_ref) => self
                        .svc
                        .tokens
                        .get_token(instance.process_instance_id, parent_ref)
                        .await?
                        .and_then(|t| t.parent_ref_id),
                    None => None,
                };
                Ok(GatewayMergeDescriptor {
                    consume_input_token: true,
                    create_token: false,
                    implicit_end: false,
                    output_token_ref: Some(output_ref),
                    output_parent_token_ref: output_parent,
                })
            }

            // Merge-then-split: consume the arrived family, mint a fresh one
            // parented like the consumed tokens were.
            (true, true) => {
                let token = self.current_token(instance).await?;
                Ok(GatewayMergeDescriptor {
                    consume_input_token: true,
                    create_token: true,
                    implicit_end: false,
                    output_token_ref: Some(Uuid::new_v4()),
                    output_parent_token_ref: token.parent_ref_id,
                })
            }
        }
    }
}
