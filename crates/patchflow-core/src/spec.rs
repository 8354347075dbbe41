//! Node specifications
//!
//! A `NodeSpec` describes everything needed to render a node type in the
//! palette and validate connections: ports with free-form type tags,
//! required flags and defaults. Specs are produced either natively (built-in
//! types, embedder registrations) or by normalizing the declarative
//! `NODE_INFO` record a plugin module exposes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The wildcard type tag, compatible with every other tag
pub const WILDCARD_TAG: &str = "ANY";

/// Error produced when normalizing a raw `NODE_INFO` record
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("NODE_INFO is not an object")]
    NotAnObject,
    #[error("NODE_INFO is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("NODE_INFO field '{0}' has the wrong shape")]
    InvalidField(&'static str),
}

/// A named, typed port on a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    /// Free-form type tag; used for UI coloring and the validator's
    /// optional compatibility warning, nothing else
    #[serde(rename = "type", default)]
    pub data_type: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl PortSpec {
    /// Create a required port
    pub fn required(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            required: true,
            default: None,
        }
    }

    /// Create an optional port
    pub fn optional(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            required: false,
            default: None,
        }
    }

    /// Set a default value; a port with a default is never required
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }

    /// Whether this port's tag matches anything
    pub fn is_wildcard(&self) -> bool {
        tag_is_wildcard(&self.data_type)
    }
}

fn tag_is_wildcard(tag: &str) -> bool {
    tag.is_empty() || tag == WILDCARD_TAG
}

/// Check whether two port type tags may be connected without a warning
pub fn tags_compatible(source: &str, target: &str) -> bool {
    tag_is_wildcard(source) || tag_is_wildcard(target) || source == target
}

/// Complete description of a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique type identifier (e.g. "bubble_pass")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable label
    pub label: String,
    /// Palette grouping, display only
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Longer documentation shown in the node inspector
    #[serde(default)]
    pub doc: String,
    /// Input port definitions, in positional order
    pub inputs: Vec<PortSpec>,
    /// Output port definitions, in positional order
    pub outputs: Vec<PortSpec>,
}

impl NodeSpec {
    pub fn new(
        node_type: impl Into<String>,
        label: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            label: label.into(),
            category: category.into(),
            description: String::new(),
            doc: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Normalize a raw `NODE_INFO` record into a spec.
    ///
    /// Ports arrive as `ports_in` / `ports_out` entries of `{name, type?,
    /// required?, default?}`. An input port with a non-null default is
    /// never required; `required` itself defaults to true. Missing type
    /// tags become the wildcard.
    pub fn from_node_info(raw: &Value) -> Result<Self, SpecError> {
        let obj = raw.as_object().ok_or(SpecError::NotAnObject)?;

        let node_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SpecError::MissingField("type"))?
            .to_string();

        let label = obj
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(&node_type)
            .to_string();

        let category = obj
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("UNCATEGORIZED")
            .to_string();

        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let doc = obj
            .get("doc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let inputs = normalize_ports(obj.get("ports_in"), "ports_in", true)?;
        let outputs = normalize_ports(obj.get("ports_out"), "ports_out", false)?;

        Ok(Self {
            node_type,
            label,
            category,
            description,
            doc,
            inputs,
            outputs,
        })
    }
}

fn normalize_ports(
    raw: Option<&Value>,
    field: &'static str,
    is_input: bool,
) -> Result<Vec<PortSpec>, SpecError> {
    let entries = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(SpecError::InvalidField(field)),
    };

    let mut ports = Vec::with_capacity(entries.len());
    for entry in entries {
        let obj = entry.as_object().ok_or(SpecError::InvalidField(field))?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or(SpecError::InvalidField(field))?
            .to_string();
        let data_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(WILDCARD_TAG)
            .to_string();
        let default = obj.get("default").filter(|v| !v.is_null()).cloned();
        let required = if is_input {
            default.is_none()
                && obj
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
        } else {
            true
        };
        ports.push(PortSpec {
            name,
            data_type,
            required,
            default,
        });
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalizes_ports() {
        let info = json!({
            "type": "test_normalize",
            "label": "T",
            "category": "T",
            "ports_in": [
                {"name": "a", "type": "ARRAY"},
                {"name": "b", "type": "NUMBER", "default": 50},
                {"name": "c", "type": "ARRAY", "required": false},
            ],
            "ports_out": [{"name": "out", "type": "ARRAY"}],
        });

        let spec = NodeSpec::from_node_info(&info).unwrap();
        assert_eq!(spec.node_type, "test_normalize");
        assert!(spec.inputs[0].required);
        assert!(spec.inputs[0].default.is_none());
        assert!(!spec.inputs[1].required);
        assert_eq!(spec.inputs[1].default, Some(json!(50)));
        assert!(!spec.inputs[2].required);
        assert_eq!(spec.outputs.len(), 1);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let info = json!({"type": "bare"});
        let spec = NodeSpec::from_node_info(&info).unwrap();
        assert_eq!(spec.label, "bare");
        assert_eq!(spec.category, "UNCATEGORIZED");
        assert!(spec.inputs.is_empty());
        assert!(spec.outputs.is_empty());
    }

    #[test]
    fn test_missing_type_is_an_error() {
        let info = json!({"label": "No Type"});
        assert!(matches!(
            NodeSpec::from_node_info(&info),
            Err(SpecError::MissingField("type"))
        ));
    }

    #[test]
    fn test_missing_type_tag_becomes_wildcard() {
        let info = json!({
            "type": "t",
            "ports_in": [{"name": "x"}],
        });
        let spec = NodeSpec::from_node_info(&info).unwrap();
        assert_eq!(spec.inputs[0].data_type, WILDCARD_TAG);
        assert!(spec.inputs[0].is_wildcard());
    }

    #[test]
    fn test_tag_compatibility() {
        assert!(tags_compatible("ARRAY", "ARRAY"));
        assert!(tags_compatible("ANY", "NUMBER"));
        assert!(tags_compatible("NUMBER", ""));
        assert!(!tags_compatible("NUMBER", "STRING"));
    }
}
