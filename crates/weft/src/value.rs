//! Typed values and task input expressions.
//!
//! Task inputs and outputs are maps of [`TypedValue`]s. An input is either a
//! literal or an expression selecting (part of) a dependency task's output;
//! expressions are evaluated by the task API right before dispatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A value with a declared type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    /// The declared type of `value`.
    pub tag: String,
    /// The value itself.
    pub value: Value,
}

impl TypedValue {
    /// Wrap a JSON value, deriving the tag from its kind.
    pub fn json(value: Value) -> Self {
        let tag = match &value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(n) if n.is_f64() => "float",
            Value::Number(_) => "int",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        Self {
            tag: tag.to_owned(),
            value,
        }
    }

    /// The nil value, used where an optional dependency produced no output.
    pub fn nil() -> Self {
        Self::json(Value::Null)
    }
}

/// A map of named typed values; the shape of task inputs and outputs.
pub type ValueMap = BTreeMap<String, TypedValue>;

/// One configured task input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSpec {
    /// A literal value passed through unchanged.
    Literal {
        /// The value to pass.
        value: TypedValue,
    },
    /// A reference to a dependency task's output, optionally drilling into
    /// the value with a JSON pointer.
    Output {
        /// The dependency task id.
        task: String,
        /// Output field name; the whole output map when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// JSON pointer applied to the selected value (e.g. `/items/0`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A reference to the invocation's caller-provided inputs.
    Invocation {
        /// Input field name; the whole input map when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// JSON pointer applied to the selected value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

fn select(map: &ValueMap, field: &Option<String>) -> Value {
    match field {
        Some(field) => map.get(field).map(|v| v.value.clone()).unwrap_or(Value::Null),
        None => {
            let object: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect();
            Value::Object(object)
        }
    }
}

fn drill(name: &str, source: &str, selected: Value, path: &Option<String>) -> Result<Value> {
    match path {
        Some(pointer) => selected.pointer(pointer).cloned().ok_or_else(|| {
            Error::invalid_event(format!("input {name}: no value at {pointer} in {source}"))
        }),
        None => Ok(selected),
    }
}

/// Evaluate input expressions against the invocation inputs and dependency
/// outputs.
///
/// `outputs` looks up the recorded output map of a task; it returns `None`
/// for tasks that produced no output (e.g. an optional dependency that
/// failed), in which case references resolve to [`TypedValue::nil`].
pub fn resolve_inputs<'a, F>(
    specs: &BTreeMap<String, InputSpec>,
    invocation_inputs: &ValueMap,
    outputs: F,
) -> Result<ValueMap>
where
    F: Fn(&str) -> Option<&'a ValueMap>,
{
    let mut resolved = ValueMap::new();
    for (name, spec) in specs {
        let value = match spec {
            InputSpec::Literal { value } => value.clone(),
            InputSpec::Output { task, field, path } => {
                let Some(output) = outputs(task) else {
                    resolved.insert(name.clone(), TypedValue::nil());
                    continue;
                };
                let selected = select(output, field);
                TypedValue::json(drill(name, &format!("output of task {task}"), selected, path)?)
            }
            InputSpec::Invocation { field, path } => {
                let selected = select(invocation_inputs, field);
                TypedValue::json(drill(name, "invocation inputs", selected, path)?)
            }
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output_of(value: Value) -> ValueMap {
        BTreeMap::from([("result".to_owned(), TypedValue::json(value))])
    }

    #[test]
    fn typed_value_tags() {
        assert_eq!(TypedValue::json(json!(1)).tag, "int");
        assert_eq!(TypedValue::json(json!(1.5)).tag, "float");
        assert_eq!(TypedValue::json(json!("x")).tag, "string");
        assert_eq!(TypedValue::json(json!(null)).tag, "null");
        assert_eq!(TypedValue::json(json!({"a": 1})).tag, "object");
    }

    fn no_inputs() -> ValueMap {
        ValueMap::new()
    }

    #[test]
    fn literal_inputs_pass_through() {
        let specs = BTreeMap::from([(
            "x".to_owned(),
            InputSpec::Literal {
                value: TypedValue::json(json!(42)),
            },
        )]);

        let resolved = resolve_inputs(&specs, &no_inputs(), |_| None).unwrap();
        assert_eq!(resolved["x"].value, json!(42));
    }

    #[test]
    fn output_reference_selects_field() {
        let upstream = output_of(json!({"items": [10, 20]}));
        let specs = BTreeMap::from([(
            "first".to_owned(),
            InputSpec::Output {
                task: "a".to_owned(),
                field: Some("result".to_owned()),
                path: Some("/items/0".to_owned()),
            },
        )]);

        let resolved = resolve_inputs(&specs, &no_inputs(), |task| {
            (task == "a").then_some(&upstream)
        })
        .unwrap();
        assert_eq!(resolved["first"].value, json!(10));
    }

    #[test]
    fn output_reference_without_field_yields_whole_map() {
        let upstream = output_of(json!(7));
        let specs = BTreeMap::from([(
            "all".to_owned(),
            InputSpec::Output {
                task: "a".to_owned(),
                field: None,
                path: None,
            },
        )]);

        let resolved = resolve_inputs(&specs, &no_inputs(), |task| {
            (task == "a").then_some(&upstream)
        })
        .unwrap();
        assert_eq!(resolved["all"].value, json!({"result": 7}));
    }

    #[test]
    fn invocation_reference_reads_caller_inputs() {
        let inputs = ValueMap::from([("x".to_owned(), TypedValue::json(json!(1)))]);
        let specs = BTreeMap::from([(
            "x".to_owned(),
            InputSpec::Invocation {
                field: Some("x".to_owned()),
                path: None,
            },
        )]);

        let resolved = resolve_inputs(&specs, &inputs, |_| None).unwrap();
        assert_eq!(resolved["x"].value, json!(1));
    }

    #[test]
    fn missing_output_resolves_to_nil() {
        let specs = BTreeMap::from([(
            "x".to_owned(),
            InputSpec::Output {
                task: "gone".to_owned(),
                field: None,
                path: None,
            },
        )]);

        let resolved = resolve_inputs(&specs, &no_inputs(), |_| None).unwrap();
        assert_eq!(resolved["x"], TypedValue::nil());
    }

    #[test]
    fn bad_pointer_is_an_error() {
        let upstream = output_of(json!({"a": 1}));
        let specs = BTreeMap::from([(
            "x".to_owned(),
            InputSpec::Output {
                task: "a".to_owned(),
                field: Some("result".to_owned()),
                path: Some("/missing".to_owned()),
            },
        )]);

        assert!(
            resolve_inputs(&specs, &no_inputs(), |task| (task == "a").then_some(&upstream))
                .is_err()
        );
    }
}
