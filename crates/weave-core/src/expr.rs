//! JEXL condition evaluation for rules and trigger filters.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of pre-registered
//! transforms and exposes boolean evaluation with JavaScript-style
//! truthiness. Payloads are always passed as context objects, never
//! interpolated into expression strings.

use serde_json::{Value, json};

use crate::path::value_truthy;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid condition context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with standard transforms registered.
///
/// Used for step success/failure rules, condition step branching, and
/// trigger payload filters.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(items)) => items.len(),
                    Some(Value::Object(map)) => map.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1);
                let found = match (args.first(), needle) {
                    (Some(Value::String(s)), Some(Value::String(n))) => s.contains(n.as_str()),
                    (Some(Value::Array(items)), Some(n)) => items.contains(n),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.ends_with(suffix)))
            })
            .with_transform("not", |args: &[Value]| {
                let truthy = args.first().map(value_truthy).unwrap_or(false);
                Ok(json!(!truthy))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JS-style truthiness.
    /// A missing identifier evaluates to null, so comparisons against
    /// absent fields are false rather than errors.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;
        Ok(value_truthy(&result))
    }

    /// Evaluate an expression to its raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ConditionError> {
        if !context.is_object() {
            return Err(ConditionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, ctx: Value) -> bool {
        ConditionEvaluator::new().evaluate_bool(expr, &ctx).unwrap()
    }

    #[test]
    fn comparison_operators() {
        let ctx = json!({"agent": {"output": {"confidence_score": 0.95}}});
        assert!(eval("agent.output.confidence_score >= 0.8", ctx.clone()));
        assert!(!eval("agent.output.confidence_score < 0.5", ctx));
    }

    #[test]
    fn equality_on_nested_fields() {
        let ctx = json!({"ticket": {"status": "new", "priority": 2}});
        assert!(eval("ticket.status == 'new'", ctx.clone()));
        assert!(eval("ticket.priority == 2", ctx.clone()));
        assert!(!eval("ticket.status == 'closed'", ctx));
    }

    #[test]
    fn boolean_combinators() {
        let ctx = json!({"a": true, "b": false, "n": 3});
        assert!(eval("a && n > 1", ctx.clone()));
        assert!(eval("b || a", ctx.clone()));
        assert!(eval("!b", ctx));
    }

    #[test]
    fn absent_fields_compare_false() {
        let ctx = json!({"present": 1});
        assert!(!eval("missing == 'x'", ctx.clone()));
        assert!(!eval("missing.deeper == 1", ctx));
    }

    #[test]
    fn truthiness_of_non_boolean_results() {
        let ctx = json!({"name": "weave", "empty": "", "zero": 0, "items": [1]});
        assert!(eval("name", ctx.clone()));
        assert!(!eval("empty", ctx.clone()));
        assert!(!eval("zero", ctx.clone()));
        assert!(eval("items", ctx));
    }

    #[test]
    fn string_transforms_in_expressions() {
        let ctx = json!({"label": "  URGENT  "});
        assert!(eval("label|trim|lower == 'urgent'", ctx.clone()));
        assert!(eval("label|trim|startsWith('URG')", ctx));
    }

    #[test]
    fn contains_and_length() {
        let ctx = json!({"tags": ["billing", "refund"], "title": "payment failed"});
        assert!(eval("tags|contains('refund')", ctx.clone()));
        assert!(eval("title|contains('payment')", ctx.clone()));
        assert!(eval("tags|length == 2", ctx));
    }

    #[test]
    fn malformed_expression_is_error() {
        let evaluator = ConditionEvaluator::new();
        let result = evaluator.evaluate_bool("a ==", &json!({"a": 1}));
        assert!(matches!(result, Err(ConditionError::EvalFailed(_))));
    }

    #[test]
    fn non_object_context_is_rejected() {
        let evaluator = ConditionEvaluator::new();
        assert!(matches!(
            evaluator.evaluate_bool("a", &json!([1, 2])),
            Err(ConditionError::InvalidContext(_))
        ));
    }

    #[test]
    fn evaluate_value_returns_raw_result() {
        let evaluator = ConditionEvaluator::new();
        let v = evaluator
            .evaluate_value("a + b", &json!({"a": 2, "b": 3}))
            .unwrap();
        assert_eq!(v, json!(5.0));
    }
}
