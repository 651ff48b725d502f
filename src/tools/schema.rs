//! Structural validation of tool arguments against their declared schema
//!
//! Covers the subset MCP tool schemas use in practice: top-level object
//! shape, `required` membership, primitive `type` tags, and `enum` lists.
//! Anything the schema does not constrain passes through untouched.

use serde_json::Value;

use crate::error::{Error, Result};

/// Check `args` against a tool's input schema.
///
/// Runs before anything touches a transport, so a bad call costs nothing
/// but this function.
pub fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> Result<()> {
    let schema_obj = match schema.as_object() {
        Some(obj) => obj,
        // A schema that is not an object constrains nothing
        None => return Ok(()),
    };

    if schema_obj.get("type").and_then(|t| t.as_str()) == Some("object") && !args.is_object() {
        return Err(Error::SchemaValidation(format!(
            "tool '{}' expects an object argument, got {}",
            tool,
            type_name(args)
        )));
    }

    let args_obj = match args.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|r| r.as_str()) {
            if !args_obj.contains_key(name) {
                return Err(Error::SchemaValidation(format!(
                    "tool '{}' requires argument '{}'",
                    tool, name
                )));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|p| p.as_object()) {
        for (name, property) in properties {
            if let Some(value) = args_obj.get(name) {
                check_property(tool, name, property, value)?;
            }
        }
    }

    Ok(())
}

fn check_property(tool: &str, name: &str, schema: &Value, value: &Value) -> Result<()> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !type_matches(expected, value) {
            return Err(Error::SchemaValidation(format!(
                "tool '{}' argument '{}' should be {}, got {}",
                tool,
                name,
                expected,
                type_name(value)
            )));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            return Err(Error::SchemaValidation(format!(
                "tool '{}' argument '{}' is not one of the allowed values",
                tool, name
            )));
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type tags are not enforced
        _ => true,
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "mode": { "type": "string", "enum": ["read", "write"] },
                "offset": { "type": "integer" }
            },
            "required": ["path"]
        })
    }

    #[test]
    fn test_valid_arguments_pass() {
        let args = json!({ "path": "/tmp/x", "mode": "read", "offset": 10 });
        assert!(validate_arguments("file", &file_schema(), &args).is_ok());
    }

    #[test]
    fn test_missing_required_argument() {
        let err = validate_arguments("file", &file_schema(), &json!({ "mode": "read" }))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let err = validate_arguments("file", &file_schema(), &json!({ "path": 42 })).unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
        assert!(err.to_string().contains("string"));
    }

    #[test]
    fn test_enum_membership_is_enforced() {
        let args = json!({ "path": "/tmp/x", "mode": "append" });
        let err = validate_arguments("file", &file_schema(), &args).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn test_integer_rejects_float() {
        let args = json!({ "path": "/tmp/x", "offset": 1.5 });
        let err = validate_arguments("file", &file_schema(), &args).unwrap_err();
        assert!(err.to_string().contains("offset"));
    }

    #[test]
    fn test_unconstrained_arguments_pass_through() {
        let args = json!({ "path": "/tmp/x", "extra": { "anything": true } });
        assert!(validate_arguments("file", &file_schema(), &args).is_ok());
    }

    #[test]
    fn test_non_object_schema_constrains_nothing() {
        assert!(validate_arguments("loose", &json!(true), &json!({ "a": 1 })).is_ok());
        assert!(validate_arguments("loose", &Value::Null, &json!("text")).is_ok());
    }

    #[test]
    fn test_object_schema_rejects_non_object_args() {
        let err = validate_arguments("file", &file_schema(), &json!("just a string")).unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
    }
}
