//! Deterministic structural validation for the Check phase.
//!
//! Evaluates a candidate output against a spec node's type and constraints
//! and returns itemized violations. Free-text success criteria are judged
//! separately via the generative collaborator (see `cycle`); this module is
//! pure and idempotent.

use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;

use crate::spec::{Constraints, Format, SpecKind, TargetOutputSpec};

/// Validate `value` against `spec`, returning every violation found.
///
/// An empty result means the structural requirements pass.
pub fn structural_violations(spec: &TargetOutputSpec, value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    check_node(spec, value, "$", &mut violations);
    violations
}

fn check_node(spec: &TargetOutputSpec, value: &Value, path: &str, out: &mut Vec<String>) {
    match spec.kind {
        SpecKind::String => {
            let Some(s) = value.as_str() else {
                out.push(type_mismatch(path, "string", value));
                return;
            };
            check_string_constraints(spec.constraints.as_ref(), s, path, out);
            check_enum(spec.constraints.as_ref(), value, path, out);
        }
        SpecKind::Number => {
            let Some(n) = value.as_f64() else {
                out.push(type_mismatch(path, "number", value));
                return;
            };
            check_range(spec.constraints.as_ref(), n, path, out);
            check_enum(spec.constraints.as_ref(), value, path, out);
        }
        SpecKind::Integer => {
            if value.as_i64().is_none() && value.as_u64().is_none() {
                out.push(type_mismatch(path, "integer", value));
                return;
            }
            if let Some(n) = value.as_f64() {
                check_range(spec.constraints.as_ref(), n, path, out);
            }
            check_enum(spec.constraints.as_ref(), value, path, out);
        }
        SpecKind::Object => {
            let Some(map) = value.as_object() else {
                out.push(type_mismatch(path, "object", value));
                return;
            };
            for name in &spec.required {
                if !map.contains_key(name) {
                    out.push(format!("{}: required property '{}' is missing", path, name));
                }
            }
            if let Some(props) = spec.properties.as_ref() {
                for (name, child) in props {
                    if let Some(child_value) = map.get(name) {
                        check_node(child, child_value, &format!("{}.{}", path, name), out);
                    }
                }
            }
        }
        SpecKind::Array => {
            let Some(items) = value.as_array() else {
                out.push(type_mismatch(path, "array", value));
                return;
            };
            if let Some(c) = spec.constraints.as_ref() {
                if let Some(min) = c.min_items {
                    if items.len() < min {
                        out.push(format!(
                            "{}: {} item(s) is below min_items {}",
                            path,
                            items.len(),
                            min
                        ));
                    }
                }
                if let Some(max) = c.max_items {
                    if items.len() > max {
                        out.push(format!(
                            "{}: {} item(s) exceeds max_items {}",
                            path,
                            items.len(),
                            max
                        ));
                    }
                }
            }
            if let Some(template) = spec.items.as_ref() {
                for (i, item) in items.iter().enumerate() {
                    check_node(template, item, &format!("{}[{}]", path, i), out);
                }
            }
        }
    }
}

fn check_string_constraints(
    constraints: Option<&Constraints>,
    s: &str,
    path: &str,
    out: &mut Vec<String>,
) {
    let Some(c) = constraints else { return };
    let len = s.chars().count();
    if let Some(min) = c.min_length {
        if len < min {
            out.push(format!(
                "{}: length {} is below min_length {}",
                path, len, min
            ));
        }
    }
    if let Some(max) = c.max_length {
        if len > max {
            out.push(format!(
                "{}: length {} exceeds max_length {}",
                path, len, max
            ));
        }
    }
    if let Some(format) = c.format {
        let ok = match format {
            Format::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            Format::Time => {
                NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()
                    || NaiveTime::parse_from_str(s, "%H:%M").is_ok()
            }
            Format::Uri => is_uri(s),
        };
        if !ok {
            out.push(format!(
                "{}: '{}' does not match format {:?}",
                path, s, format
            ));
        }
    }
}

fn check_range(constraints: Option<&Constraints>, n: f64, path: &str, out: &mut Vec<String>) {
    let Some(c) = constraints else { return };
    if let Some(min) = c.minimum {
        if n < min {
            out.push(format!("{}: {} is below minimum {}", path, n, min));
        }
    }
    if let Some(max) = c.maximum {
        if n > max {
            out.push(format!("{}: {} exceeds maximum {}", path, n, max));
        }
    }
}

fn check_enum(constraints: Option<&Constraints>, value: &Value, path: &str, out: &mut Vec<String>) {
    let Some(allowed) = constraints.and_then(|c| c.enum_values.as_ref()) else {
        return;
    };
    if !allowed.contains(value) {
        out.push(format!("{}: {} is not one of the allowed values", path, value));
    }
}

fn is_uri(s: &str) -> bool {
    match s.split_once(':') {
        Some((scheme, rest)) => {
            !rest.is_empty()
                && scheme
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn type_mismatch(path: &str, expected: &str, value: &Value) -> String {
    format!(
        "{}: expected {}, got {}",
        path,
        expected,
        json_type_name(value)
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
