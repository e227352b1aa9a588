//! Input validation for workflows and actions.

use conflux_types::definition::InputParam;
use serde_json::{Map, Value};

use super::error::EngineError;

/// Check `input` against declared parameters and fill in defaults.
///
/// Fails with an input error listing missing required parameters and
/// unexpected keys. The result keeps declaration order for declared keys.
pub fn validate_input(
    name: &str,
    class: &str,
    params: &[InputParam],
    mut input: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let missing: Vec<&str> = params
        .iter()
        .filter(|p| p.is_required() && !input.contains_key(&p.name))
        .map(|p| p.name.as_str())
        .collect();
    let unexpected: Vec<&str> = input
        .keys()
        .filter(|key| !params.iter().any(|p| &p.name == *key))
        .map(String::as_str)
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(EngineError::Input(format!(
            "Invalid input [name={}, class={}, missing=[{}], unexpected=[{}]]",
            name,
            class,
            missing.join(", "),
            unexpected.join(", ")
        )));
    }

    let mut out = Map::with_capacity(params.len());
    for param in params {
        let value = match input.remove(&param.name) {
            Some(value) => value,
            None => param.default.clone().unwrap_or(Value::Null),
        };
        out.insert(param.name.clone(), value);
    }
    Ok(out)
}

/// Split `input` into declared parameters and everything else. Used for
/// sub-workflows, whose undeclared input is passed along as execution
/// options instead of being rejected.
pub fn split_undeclared(
    params: &[InputParam],
    input: Map<String, Value>,
) -> (Map<String, Value>, Map<String, Value>) {
    input
        .into_iter()
        .partition(|(key, _)| params.iter().any(|p| &p.name == key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> Vec<InputParam> {
        vec![
            InputParam {
                name: "a".into(),
                default: None,
            },
            InputParam {
                name: "b".into(),
                default: Some(json!(2)),
            },
        ]
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let out = validate_input("wf", "workflow", &params(), map(json!({"a": 1}))).unwrap();
        assert_eq!(Value::Object(out), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_missing_and_unexpected_are_reported_together() {
        let err = validate_input("wf", "workflow", &params(), map(json!({"c": 3}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid input [name=wf, class=workflow, missing=[a], unexpected=[c]]"
        );
    }

    #[test]
    fn test_split_undeclared() {
        let (declared, extra) = split_undeclared(&params(), map(json!({"a": 1, "zone": "eu"})));
        assert_eq!(Value::Object(declared), json!({"a": 1}));
        assert_eq!(Value::Object(extra), json!({"zone": "eu"}));
    }
}
