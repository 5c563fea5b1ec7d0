//! Tool bindings: configured (provider, action) pairs exposed to the planner.

use serde::{Deserialize, Serialize};

/// A configured tool binding. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub id: String,
    /// Name the planner uses to reference this binding.
    pub name: String,
    pub provider: String,
    pub action: String,
    /// Free-text instructions shown to the planner and echoed in the digest.
    pub instructions: String,
    /// Declared input arguments. See [`schema_keys`] for accepted shapes.
    pub input_schema: serde_json::Value,
    /// Declared output fields.
    pub output_schema: serde_json::Value,
    pub active: bool,
}

impl ToolBinding {
    /// Declared input argument keys.
    pub fn argument_keys(&self) -> Vec<String> {
        schema_keys(&self.input_schema)
    }

    /// Declared output field names.
    pub fn output_fields(&self) -> Vec<String> {
        schema_keys(&self.output_schema)
    }

    /// Entry describing this binding in the planner prompt.
    pub fn prompt_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.instructions,
            "args": self.argument_keys(),
            "outputs": self.output_fields(),
        })
    }
}

/// Extract field names from a stored schema.
///
/// Accepts a JSON-Schema object (`properties` keys), a plain array of names,
/// or any other object (its keys). Anything else yields no keys.
pub fn schema_keys(schema: &serde_json::Value) -> Vec<String> {
    match schema {
        serde_json::Value::Object(map) => match map.get("properties") {
            Some(serde_json::Value::Object(props)) => props.keys().cloned().collect(),
            _ => map.keys().cloned().collect(),
        },
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}
