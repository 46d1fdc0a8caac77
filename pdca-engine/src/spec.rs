//! Target output schema definitions.
//!
//! A [`TargetOutputSpec`] is the declarative description of the output a
//! workflow run must produce: a finite tree of typed nodes with optional
//! constraints, free-text success criteria, and explicit inter-element
//! dependencies. Ill-formed trees (an array node carrying `properties`, a
//! `depends_on` naming an unknown sibling, ...) are rejected eagerly at
//! construction, before any run starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node type of a spec tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecKind {
    String,
    Number,
    Integer,
    Object,
    Array,
}

impl SpecKind {
    /// Human-readable name used in validation feedback
    pub fn name(&self) -> &'static str {
        match self {
            SpecKind::String => "string",
            SpecKind::Number => "number",
            SpecKind::Integer => "integer",
            SpecKind::Object => "object",
            SpecKind::Array => "array",
        }
    }
}

/// Scheduling priority for an element.
///
/// Ordering follows the derive: `High < Medium < Low`, so an ascending sort
/// places high-priority elements first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// String format constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Date,
    Time,
    Uri,
}

/// Type-appropriate structural constraints for a spec node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Minimum string length (characters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Maximum string length (characters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Minimum numeric value (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    /// Maximum numeric value (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    /// Closed set of allowed values
    #[serde(
        default,
        rename = "enum",
        skip_serializing_if = "Option::is_none"
    )]
    pub enum_values: Option<Vec<serde_json::Value>>,

    /// String format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,

    /// Minimum array length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,

    /// Maximum array length
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

/// Recursive description of the desired output shape.
///
/// Dependencies between elements are declared explicitly via `depends_on`
/// naming sibling properties; free-text cross-references in `criteria` are
/// intentionally not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutputSpec {
    /// Node type
    #[serde(rename = "type")]
    pub kind: SpecKind,

    /// What this node represents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Child properties (object nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, TargetOutputSpec>>,

    /// Item template (array nodes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<TargetOutputSpec>>,

    /// Names of required properties (object nodes only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// Structural constraints checked deterministically during Check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,

    /// Free-text success criterion, judged via the generative collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,

    /// Scheduling priority of the element this node produces
    #[serde(default)]
    pub priority: Priority,

    /// Sibling properties this node's output depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Definition errors in a target output spec
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("failed to parse spec JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse spec YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("node at '{path}': object nodes require `properties`")]
    MissingProperties { path: String },

    #[error("node at '{path}': `properties` is only valid on object nodes")]
    PropertiesOnNonObject { path: String },

    #[error("node at '{path}': array nodes require `items`")]
    MissingItems { path: String },

    #[error("node at '{path}': `items` is only valid on array nodes")]
    ItemsOnNonArray { path: String },

    #[error("node at '{path}': `required` is only valid on object nodes")]
    RequiredOnNonObject { path: String },

    #[error("node at '{path}': `required` names unknown property '{name}'")]
    UnknownRequired { path: String, name: String },

    #[error("node at '{path}': `depends_on` references unknown sibling '{name}'")]
    UnknownDependency { path: String, name: String },

    #[error("node at '{path}': `depends_on` references the node itself")]
    SelfDependency { path: String },

    #[error("root node cannot declare `depends_on`")]
    RootDependsOn,

    #[error("node at '{path}': array item templates cannot declare `depends_on`")]
    ItemTemplateDependsOn { path: String },
}

impl TargetOutputSpec {
    /// Parse a spec from a JSON document and validate it
    pub fn from_json_str(s: &str) -> Result<Self, SpecError> {
        let spec: TargetOutputSpec = serde_json::from_str(s)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a spec from a YAML document and validate it
    pub fn from_yaml_str(s: &str) -> Result<Self, SpecError> {
        let spec: TargetOutputSpec = serde_yaml::from_str(s)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate the whole tree, rejecting ill-formed nodes
    pub fn validate(&self) -> Result<(), SpecError> {
        if !self.depends_on.is_empty() {
            return Err(SpecError::RootDependsOn);
        }
        self.validate_node("$")
    }

    fn validate_node(&self, path: &str) -> Result<(), SpecError> {
        match self.kind {
            SpecKind::Object => {
                if self.items.is_some() {
                    return Err(SpecError::ItemsOnNonArray { path: path.to_string() });
                }
                let props = self
                    .properties
                    .as_ref()
                    .ok_or_else(|| SpecError::MissingProperties { path: path.to_string() })?;
                for name in &self.required {
                    if !props.contains_key(name) {
                        return Err(SpecError::UnknownRequired {
                            path: path.to_string(),
                            name: name.clone(),
                        });
                    }
                }
                for (name, child) in props {
                    let child_path = format!("{}.{}", path, name);
                    // depends_on is sibling-scoped, so it is validated here
                    // against the parent's property set
                    for dep in &child.depends_on {
                        if dep == name {
                            return Err(SpecError::SelfDependency { path: child_path });
                        }
                        if !props.contains_key(dep) {
                            return Err(SpecError::UnknownDependency {
                                path: child_path,
                                name: dep.clone(),
                            });
                        }
                    }
                    child.validate_node(&child_path)?;
                }
            }
            SpecKind::Array => {
                if self.properties.is_some() {
                    return Err(SpecError::PropertiesOnNonObject { path: path.to_string() });
                }
                if !self.required.is_empty() {
                    return Err(SpecError::RequiredOnNonObject { path: path.to_string() });
                }
                let items = self
                    .items
                    .as_ref()
                    .ok_or_else(|| SpecError::MissingItems { path: path.to_string() })?;
                let item_path = format!("{}[]", path);
                // An item template has no siblings to depend on
                if !items.depends_on.is_empty() {
                    return Err(SpecError::ItemTemplateDependsOn { path: item_path });
                }
                items.validate_node(&item_path)?;
            }
            SpecKind::String | SpecKind::Number | SpecKind::Integer => {
                if self.properties.is_some() {
                    return Err(SpecError::PropertiesOnNonObject { path: path.to_string() });
                }
                if self.items.is_some() {
                    return Err(SpecError::ItemsOnNonArray { path: path.to_string() });
                }
                if !self.required.is_empty() {
                    return Err(SpecError::RequiredOnNonObject { path: path.to_string() });
                }
            }
        }
        Ok(())
    }
}
