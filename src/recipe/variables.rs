//! Variable binding: defaults, CLI inputs, prompts, and per-variable
//! validation.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{VariableDef, VariableType};
use crate::error::{EngineError, ErrorCode, Result};
use crate::interaction::UserInteraction;

/// Produce the bound variable map for a run.
///
/// Precedence: CLI/caller inputs over defaults; variables that are still
/// missing and required either prompt (interactive) or fail. Inputs with
/// no matching definition pass through untouched.
pub async fn bind_variables(
    defs: &BTreeMap<String, VariableDef>,
    inputs: &BTreeMap<String, Value>,
    interaction: &dyn UserInteraction,
    non_interactive: bool,
) -> Result<Map<String, Value>> {
    let mut bound = Map::new();

    for (name, def) in defs {
        if let Some(raw) = inputs.get(name) {
            let value = coerce(name, raw, def)?;
            validate(name, &value, def)?;
            bound.insert(name.clone(), value);
            continue;
        }

        if let Some(default) = &def.default {
            validate(name, default, def)?;
            bound.insert(name.clone(), default.clone());
            continue;
        }

        if !def.required {
            continue;
        }

        if non_interactive {
            return Err(EngineError::new(
                ErrorCode::MissingRequiredVariable,
                format!("required variable `{name}` has no value"),
            )
            .with_suggestion(format!("pass --var {name}=<value>"))
            .with_suggestion("or add a default to the recipe"));
        }

        let value = prompt_for(name, def, interaction).await?;
        validate(name, &value, def)?;
        bound.insert(name.clone(), value);
    }

    for (name, value) in inputs {
        if !defs.contains_key(name) {
            bound.insert(name.clone(), value.clone());
        }
    }

    Ok(bound)
}

async fn prompt_for(
    name: &str,
    def: &VariableDef,
    interaction: &dyn UserInteraction,
) -> Result<Value> {
    let message = def
        .description
        .clone()
        .unwrap_or_else(|| format!("Value for `{name}`"));

    match def.var_type {
        VariableType::Boolean => {
            let answer = interaction.confirm(&message, false).await?;
            Ok(Value::Bool(answer))
        }
        VariableType::Enum => {
            let choices: Vec<String> = def
                .values
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(value_label)
                .collect();
            let answer = interaction.prompt_choice(&message, &choices).await?;
            Ok(Value::String(answer))
        }
        _ => {
            let answer = interaction.prompt_text(&message, None).await?;
            coerce(name, &Value::String(answer), def)
        }
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce a raw input to the declared type.
pub fn coerce(name: &str, raw: &Value, def: &VariableDef) -> Result<Value> {
    match def.var_type {
        VariableType::String | VariableType::Enum => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(invalid(name, "expected a string")),
        },
        VariableType::Boolean => match raw {
            Value::Bool(_) => Ok(raw.clone()),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(invalid(name, format!("`{s}` is not a boolean"))),
            },
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(invalid(name, "expected a boolean")),
            },
            _ => Err(invalid(name, "expected a boolean")),
        },
        VariableType::Number => match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::String(s) => parse_number(name, s),
            _ => Err(invalid(name, "expected a number")),
        },
        VariableType::Array => match raw {
            Value::Array(_) => Ok(raw.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(items)) => Ok(Value::Array(items)),
                _ => Err(invalid(name, "expected a JSON array")),
            },
            _ => Err(invalid(name, "expected an array")),
        },
        VariableType::Object => match raw {
            Value::Object(_) => Ok(raw.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Ok(Value::Object(map)),
                _ => Err(invalid(name, "expected a JSON object")),
            },
            _ => Err(invalid(name, "expected an object")),
        },
    }
}

fn parse_number(name: &str, s: &str) -> Result<Value> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid(name, "empty string is not a number"));
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Ok(Value::Number(int.into()));
    }
    let float: f64 = trimmed
        .parse()
        .map_err(|_| invalid(name, format!("`{s}` is not a number")))?;
    serde_json::Number::from_f64(float)
        .map(Value::Number)
        .ok_or_else(|| invalid(name, format!("`{s}` is not a finite number")))
}

/// Per-variable validation: `pattern`, `values`, numeric range.
pub fn validate(name: &str, value: &Value, def: &VariableDef) -> Result<()> {
    if let Some(pattern) = &def.pattern {
        let Value::String(s) = value else {
            return Err(invalid(name, "pattern applies to string values only"));
        };
        let re = Regex::new(pattern)
            .map_err(|e| invalid(name, format!("invalid pattern `{pattern}`: {e}")))?;
        if !re.is_match(s) {
            return Err(invalid(name, format!("`{s}` does not match /{pattern}/")));
        }
    }

    if let Some(values) = &def.values {
        if !values.contains(value) {
            return Err(invalid(
                name,
                format!(
                    "value must be one of: {}",
                    values.iter().map(value_label).collect::<Vec<_>>().join(", ")
                ),
            ));
        }
    }

    if let Value::Number(n) = value {
        if let Some(f) = n.as_f64() {
            if let Some(min) = def.min {
                if f < min {
                    return Err(invalid(name, format!("{f} is below the minimum {min}")));
                }
            }
            if let Some(max) = def.max {
                if f > max {
                    return Err(invalid(name, format!("{f} is above the maximum {max}")));
                }
            }
        }
    }

    Ok(())
}

fn invalid(name: &str, reason: impl Into<String>) -> EngineError {
    let reason = reason.into();
    EngineError::new(
        ErrorCode::VariableValidationFailed,
        format!("variable `{name}`: {reason}"),
    )
    .with_context("variable", name.to_string())
    .with_context("reason", reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::testing::ScriptedInteraction;
    use crate::interaction::NonInteractive;
    use serde_json::json;

    fn def(var_type: VariableType) -> VariableDef {
        VariableDef {
            var_type,
            ..Default::default()
        }
    }

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn defaults_then_inputs_overlay() {
        let mut defs = BTreeMap::new();
        defs.insert(
            "port".to_string(),
            VariableDef {
                var_type: VariableType::Number,
                default: Some(json!(3000)),
                ..Default::default()
            },
        );
        defs.insert(
            "host".to_string(),
            VariableDef {
                default: Some(json!("localhost")),
                ..Default::default()
            },
        );

        let bound = bind_variables(
            &defs,
            &inputs(&[("port", json!("8080"))]),
            &NonInteractive,
            true,
        )
        .await
        .unwrap();
        assert_eq!(bound["port"], json!(8080));
        assert_eq!(bound["host"], json!("localhost"));
    }

    #[tokio::test]
    async fn missing_required_fails_noninteractively() {
        let mut defs = BTreeMap::new();
        defs.insert(
            "name".to_string(),
            VariableDef {
                required: true,
                ..Default::default()
            },
        );
        let err = bind_variables(&defs, &BTreeMap::new(), &NonInteractive, true)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRequiredVariable);
    }

    #[tokio::test]
    async fn missing_required_prompts_interactively() {
        let mut defs = BTreeMap::new();
        defs.insert(
            "name".to_string(),
            VariableDef {
                required: true,
                ..Default::default()
            },
        );
        let ui = ScriptedInteraction::new(["typed-in"]);
        let bound = bind_variables(&defs, &BTreeMap::new(), &ui, false)
            .await
            .unwrap();
        assert_eq!(bound["name"], json!("typed-in"));
    }

    #[test]
    fn boolean_coercions() {
        let d = def(VariableType::Boolean);
        for truthy in ["true", "TRUE", "1", "yes", "Yes"] {
            assert_eq!(coerce("b", &json!(truthy), &d).unwrap(), json!(true));
        }
        for falsy in ["false", "0", "no", "NO"] {
            assert_eq!(coerce("b", &json!(falsy), &d).unwrap(), json!(false));
        }
        assert!(coerce("b", &json!("maybe"), &d).is_err());
    }

    #[test]
    fn number_coercion_is_strict() {
        let d = def(VariableType::Number);
        assert_eq!(coerce("n", &json!("42"), &d).unwrap(), json!(42));
        assert_eq!(coerce("n", &json!("4.5"), &d).unwrap(), json!(4.5));
        assert!(coerce("n", &json!("42abc"), &d).is_err());
        assert!(coerce("n", &json!(""), &d).is_err());
    }

    #[test]
    fn array_and_object_accept_json_strings() {
        assert_eq!(
            coerce("a", &json!("[1,2]"), &def(VariableType::Array)).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            coerce("o", &json!(r#"{"k":1}"#), &def(VariableType::Object)).unwrap(),
            json!({"k":1})
        );
        assert!(coerce("a", &json!("{}"), &def(VariableType::Array)).is_err());
    }

    #[test]
    fn pattern_and_range_validation() {
        let d = VariableDef {
            pattern: Some("^[a-z-]+$".to_string()),
            ..Default::default()
        };
        assert!(validate("name", &json!("my-app"), &d).is_ok());
        let err = validate("name", &json!("My App"), &d).unwrap_err();
        assert_eq!(err.code, ErrorCode::VariableValidationFailed);

        let d = VariableDef {
            var_type: VariableType::Number,
            min: Some(1.0),
            max: Some(10.0),
            ..Default::default()
        };
        assert!(validate("n", &json!(5), &d).is_ok());
        assert!(validate("n", &json!(0), &d).is_err());
        assert!(validate("n", &json!(11), &d).is_err());
    }

    #[test]
    fn enum_values_are_enforced() {
        let d = VariableDef {
            var_type: VariableType::Enum,
            values: Some(vec![json!("rest"), json!("graphql")]),
            ..Default::default()
        };
        assert!(validate("api", &json!("rest"), &d).is_ok());
        assert!(validate("api", &json!("soap"), &d).is_err());
    }

    #[tokio::test]
    async fn undeclared_inputs_pass_through() {
        let bound = bind_variables(
            &BTreeMap::new(),
            &inputs(&[("extra", json!("kept"))]),
            &NonInteractive,
            true,
        )
        .await
        .unwrap();
        assert_eq!(bound["extra"], json!("kept"));
    }
}
