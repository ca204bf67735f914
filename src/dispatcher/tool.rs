//! Uniform tool invocation contract (`spec.md` §4.8, §1's "uniform
//! invocation contract" for individual tool implementations which are
//! themselves out of scope).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    Timeout,
    Upstream,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Each tool exposes `{name, description, inputSchema, execute(args) ->
/// result}`. Inputs are validated against `input_schema` before
/// `execute` is invoked.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Validate `arguments` against `schema`, returning a `Validation` error
/// that callers can surface without ever invoking the tool.
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), ToolError> {
    let compiled = jsonschema::validator_for(schema).map_err(|e| ToolError {
        kind: ToolErrorKind::Validation,
        message: format!("invalid schema: {e}"),
    })?;
    if let Err(err) = compiled.validate(arguments) {
        return Err(ToolError {
            kind: ToolErrorKind::Validation,
            message: err.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_matching_arguments() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        let args = serde_json::json!({ "path": "/tmp/out.txt" });
        assert!(validate_arguments(&schema, &args).is_ok());
    }

    #[test]
    fn validation_rejects_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        let args = serde_json::json!({});
        let err = validate_arguments(&schema, &args).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Validation);
    }
}
