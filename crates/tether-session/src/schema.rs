//! Pre-flight validation of tool arguments against the tool's input schema.
//!
//! Checks required-field presence and primitive types, recursing into array
//! `items` and nested object `properties`. Scalars are coerced leniently:
//! a numeric or boolean string satisfies a number/integer/boolean slot.
//! Properties not named in the schema pass through untouched. All problems
//! are collected and reported together.

use serde_json::Value;

/// Validate `args` against `schema`; an empty vector means valid.
pub fn validate_arguments(schema: &Value, args: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    check_object(schema, args, "", &mut issues);
    issues
}

fn check_object(schema: &Value, value: &Value, path: &str, issues: &mut Vec<String>) {
    let Some(value_obj) = value.as_object() else {
        issues.push(format!("expected object at {}, got {}", describe_path(path), type_name(value)));
        return;
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !value_obj.contains_key(field) {
                issues.push(format!(
                    "missing required field '{}'",
                    join_path(path, field)
                ));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (key, prop_schema) in properties {
        if let Some(prop_value) = value_obj.get(key) {
            check_value(prop_schema, prop_value, &join_path(path, key), issues);
        }
    }
}

fn check_value(schema: &Value, value: &Value, path: &str, issues: &mut Vec<String>) {
    let Some(expected) = schema.get("type").and_then(Value::as_str) else {
        return; // untyped slots accept anything
    };

    match expected {
        "string" => {
            if !value.is_string() {
                issues.push(mismatch(path, "string", value));
            }
        }
        "number" => {
            if !is_number_like(value) {
                issues.push(mismatch(path, "number", value));
            }
        }
        "integer" => {
            if !is_integer_like(value) {
                issues.push(mismatch(path, "integer", value));
            }
        }
        "boolean" => {
            if !is_boolean_like(value) {
                issues.push(mismatch(path, "boolean", value));
            }
        }
        "array" => match value.as_array() {
            Some(items) => {
                if let Some(item_schema) = schema.get("items") {
                    for (index, item) in items.iter().enumerate() {
                        check_value(item_schema, item, &format!("{path}[{index}]"), issues);
                    }
                }
            }
            None => issues.push(mismatch(path, "array", value)),
        },
        "object" => {
            if value.is_object() {
                check_object(schema, value, path, issues);
            } else {
                issues.push(mismatch(path, "object", value));
            }
        }
        _ => {} // unknown type keyword; let the server judge
    }
}

fn is_number_like(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_integer_like(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        Value::String(s) => s.parse::<i64>().is_ok(),
        _ => false,
    }
}

fn is_boolean_like(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => s == "true" || s == "false",
        _ => false,
    }
}

fn mismatch(path: &str, expected: &str, value: &Value) -> String {
    format!(
        "expected {expected} at {}, got {}",
        describe_path(path),
        type_name(value)
    )
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn describe_path(path: &str) -> String {
    if path.is_empty() {
        "arguments".to_string()
    } else {
        format!("'{path}'")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
