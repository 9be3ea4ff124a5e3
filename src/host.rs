use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::error;

use crate::error::{RbError, Result};

/// Capabilities the hosting orchestration engine offers a deployment step.
pub trait ScriptHost {
    /// Look up a resolved input (blueprint property or inventory payload).
    fn resolve_input(&self, key: &str) -> Result<Value>;
    fn publish_output(&mut self, key: &str, value: Value);
    fn report_error(&mut self, message: &str);

    /// String input, failing when the key is missing or not a string.
    fn resolve_string(&self, key: &str) -> Result<String> {
        match self.resolve_input(key)? {
            Value::String(value) => Ok(value),
            other => Err(RbError::Config(format!(
                "input '{key}' must be a string, got {other}"
            ))),
        }
    }
}

/// Host backed by a JSON object of pre-resolved inputs.
#[derive(Debug, Default)]
pub struct JsonScriptHost {
    inputs: Map<String, Value>,
    outputs: Map<String, Value>,
    errors: Vec<String>,
}

impl JsonScriptHost {
    pub fn new(inputs: Value) -> Result<Self> {
        let inputs = inputs
            .as_object()
            .cloned()
            .ok_or_else(|| RbError::Config("inputs JSON must be an object".into()))?;
        Ok(Self {
            inputs,
            ..Self::default()
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            RbError::Config(format!("failed to read inputs {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| {
            RbError::Config(format!("failed to parse inputs {}: {err}", path.display()))
        })?;
        Self::new(value)
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn outputs_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.outputs)?)
    }
}

impl ScriptHost for JsonScriptHost {
    fn resolve_input(&self, key: &str) -> Result<Value> {
        self.inputs
            .get(key)
            .cloned()
            .ok_or_else(|| RbError::Config(format!("missing input '{key}'")))
    }

    fn publish_output(&mut self, key: &str, value: Value) {
        self.outputs.insert(key.to_string(), value);
    }

    fn report_error(&mut self, message: &str) {
        error!("{message}");
        self.errors.push(message.to_string());
    }
}

/// Value of `key` in a `resource-accumulator-resolved-data` list, or an
/// empty string when the parameter was never resolved.
pub fn resolved_parameter(payload: &Value, key: &str) -> String {
    payload
        .get("resource-accumulator-resolved-data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|entry| entry.get("param-name").and_then(Value::as_str) == Some(key))
        .and_then(|entry| entry.get("param-value"))
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}
