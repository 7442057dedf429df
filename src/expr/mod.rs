use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, build_operator_tree,
};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::EngineError;

/// Opaque guard-expression evaluator. The core only needs a boolean verdict;
/// a guard that evaluates to a non-boolean value is a configuration error.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_guard(
        &self,
        expression: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<bool, EngineError>;
}

/// Default evaluator backed by `evalexpr`, fed with the process variables.
pub struct EvalexprEvaluator;

impl ExpressionEvaluator for EvalexprEvaluator {
    fn evaluate_guard(
        &self,
        expression: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<bool, EngineError> {
        let tree = build_operator_tree::<DefaultNumericTypes>(expression).map_err(|e| {
            EngineError::Expression {
                expression: expression.to_string(),
                message: e.to_string(),
            }
        })?;

        let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (k, v) in variables {
            let eval_val = match v {
                Value::String(s) => Some(evalexpr::Value::String(s.clone())),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(evalexpr::Value::Int(i))
                    } else if let Some(f) = n.as_f64() {
                        Some(evalexpr::Value::Float(f))
                    } else {
                        None
                    }
                }
                Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
                // Arrays/objects are not addressable from guards.
                _ => None,
            };
            if let Some(ev) = eval_val {
                let _ = ctx.set_value(k.clone(), ev);
            }
        }

        tree.eval_boolean_with_context(&ctx)
            .map_err(|e| EngineError::Expression {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}
