//! JEXL expression evaluation for task input, publish clauses, transition
//! conditions and workflow output.
//!
//! Expressions are embedded in definition values as `<% expr %>`. A string
//! that is exactly one expression evaluates to the raw JSON result; a string
//! with embedded expressions is interpolated. Non-string values are walked
//! recursively.
//!
//! **Security note:** Data is always passed as the context object, NEVER
//! interpolated into expression strings.

use serde_json::{json, Map, Value};

const OPEN: &str = "<%";
const CLOSE: &str = "%>";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Can not evaluate expression '{expression}': {message}")]
    EvalFailed { expression: String, message: String },

    #[error("Unterminated expression in '{0}'")]
    Unterminated(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Evaluator port
// ---------------------------------------------------------------------------

/// Evaluates a single bare expression (no `<% %>` delimiters) against a
/// JSON object context.
///
/// The engine only depends on this trait; [`JexlEvaluator`] is the default.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError>;
}

/// JEXL evaluator with the standard transforms registered.
///
/// `jexl_eval::Evaluator` holds non-`Send` closures, so one is built per
/// evaluation and never outlives the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        standard_evaluator()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(|v| v.as_str()).unwrap_or("")
}

fn second_str(args: &[Value]) -> &str {
    args.get(1).and_then(|v| v.as_str()).unwrap_or("")
}

fn standard_evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        // String transforms
        .with_transform("lower", |args: &[Value]| Ok(json!(first_str(args).to_lowercase())))
        .with_transform("upper", |args: &[Value]| Ok(json!(first_str(args).to_uppercase())))
        .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
        .with_transform("split", |args: &[Value]| {
            let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
            let parts: Vec<&str> = first_str(args).split(delimiter).collect();
            Ok(json!(parts))
        })
        // Boolean transforms
        .with_transform("not", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!(!is_truthy(&val)))
        })
        // Search transforms
        .with_transform("contains", |args: &[Value]| {
            let found = match args.first() {
                Some(Value::Array(items)) => args.get(1).is_some_and(|needle| items.contains(needle)),
                Some(Value::Object(map)) => map.contains_key(second_str(args)),
                _ => first_str(args).contains(second_str(args)),
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            Ok(json!(first_str(args).starts_with(second_str(args))))
        })
        .with_transform("endsWith", |args: &[Value]| {
            Ok(json!(first_str(args).ends_with(second_str(args))))
        })
        .with_transform("match", |args: &[Value]| {
            // Substring match, not regex
            Ok(json!(first_str(args).contains(second_str(args))))
        })
        // Collection transforms
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("keys", |args: &[Value]| {
            let keys: Vec<String> = match args.first() {
                Some(Value::Object(o)) => o.keys().cloned().collect(),
                _ => Vec::new(),
            };
            Ok(json!(keys))
        })
        .with_transform("json", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!(val.to_string()))
        })
}

// ---------------------------------------------------------------------------
// Truthiness
// ---------------------------------------------------------------------------

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate a condition. A bare expression and a `<% %>`-wrapped one are
/// both accepted.
pub fn evaluate_bool(
    evaluator: &dyn ExpressionEvaluator,
    condition: &str,
    context: &Value,
) -> Result<bool, ExpressionError> {
    let value = if has_expression(condition) {
        evaluate_str(evaluator, condition, context)?
    } else {
        evaluator.evaluate(condition, context)?
    };
    Ok(is_truthy(&value))
}

// ---------------------------------------------------------------------------
// Embedded expressions
// ---------------------------------------------------------------------------

/// Whether `s` contains at least one `<% ... %>` expression.
pub fn has_expression(s: &str) -> bool {
    s.find(OPEN)
        .is_some_and(|start| s[start + OPEN.len()..].contains(CLOSE))
}

/// Whether a value contains an expression anywhere.
pub fn value_has_expression(value: &Value) -> bool {
    match value {
        Value::String(s) => has_expression(s),
        Value::Array(items) => items.iter().any(value_has_expression),
        Value::Object(map) => map.iter().any(|(k, v)| has_expression(k) || value_has_expression(v)),
        _ => false,
    }
}

/// If `s` is exactly one expression, return its body.
fn whole_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let body = trimmed.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if body.contains(OPEN) || body.contains(CLOSE) {
        return None;
    }
    Some(body.trim())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluate a string that may contain expressions.
pub fn evaluate_str(
    evaluator: &dyn ExpressionEvaluator,
    s: &str,
    context: &Value,
) -> Result<Value, ExpressionError> {
    if let Some(body) = whole_expression(s) {
        return evaluator.evaluate(body, context);
    }
    if !has_expression(s) {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| ExpressionError::Unterminated(s.to_string()))?;
        let value = evaluator.evaluate(after[..end].trim(), context)?;
        out.push_str(&render(&value));
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Evaluate every expression inside `value`, preserving its structure.
/// Object keys may contain expressions too.
pub fn evaluate_recursively(
    evaluator: &dyn ExpressionEvaluator,
    value: &Value,
    context: &Value,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => evaluate_str(evaluator, s, context),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_recursively(evaluator, item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => evaluate_map(evaluator, map, context).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// [`evaluate_recursively`] for a map of values.
pub fn evaluate_map(
    evaluator: &dyn ExpressionEvaluator,
    map: &Map<String, Value>,
    context: &Value,
) -> Result<Map<String, Value>, ExpressionError> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        let key = if has_expression(key) {
            render(&evaluate_str(evaluator, key, context)?)
        } else {
            key.clone()
        };
        out.insert(key, evaluate_recursively(evaluator, value, context)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
