//! Result assembly and partial-failure reporting.
//!
//! Reassembles accepted element outputs into the spec's declared shape.
//! Unsuccessful elements are never silently dropped: optional ones are
//! omitted from the output but reported, and any missing required element
//! downgrades the run to a partial result.

use pdca_engine_sdk::RunStatus;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::spec::{SpecKind, TargetOutputSpec};
use crate::types::{
    Element, ElementId, ElementState, Requiredness, UnsuccessfulElement, UnsuccessfulReason,
};

/// Assembled run result before it is wrapped into a report
#[derive(Debug)]
pub struct Assembly {
    pub status: RunStatus,
    pub output: Value,
    pub unsuccessful: Vec<UnsuccessfulElement>,
}

/// Assemble final elements back into the spec's shape.
///
/// `order` is the processing order; the unsuccessful list follows it.
pub fn assemble(
    spec: &TargetOutputSpec,
    elements: &BTreeMap<ElementId, Element>,
    order: &[ElementId],
) -> Assembly {
    let output = build_node(spec, "$", elements).unwrap_or(Value::Null);

    let status = if elements
        .values()
        .any(|e| e.requiredness == Requiredness::Required && e.state != ElementState::Completed)
    {
        RunStatus::Partial
    } else {
        RunStatus::Complete
    };

    let mut unsuccessful = Vec::new();
    for id in order {
        let Some(element) = elements.get(id) else {
            continue;
        };
        match &element.state {
            ElementState::Abandoned => unsuccessful.push(UnsuccessfulElement {
                element_id: id.clone(),
                reason: UnsuccessfulReason::MaxAttemptsExceeded,
                attempts: element.attempts.clone(),
                final_feedback: element.last_feedback.clone(),
            }),
            ElementState::Blocked { by } => unsuccessful.push(UnsuccessfulElement {
                element_id: id.clone(),
                reason: UnsuccessfulReason::BlockedByAbandonedDependency {
                    dependency: by.clone(),
                },
                attempts: element.attempts.clone(),
                final_feedback: element.last_feedback.clone(),
            }),
            _ => {}
        }
    }

    Assembly {
        status,
        output,
        unsuccessful,
    }
}

/// Rebuild the value for one spec node; `None` omits the node entirely
fn build_node(
    spec: &TargetOutputSpec,
    path: &str,
    elements: &BTreeMap<ElementId, Element>,
) -> Option<Value> {
    match spec.kind {
        SpecKind::Object => {
            let mut map = Map::new();
            if let Some(props) = spec.properties.as_ref() {
                for (name, child) in props {
                    let child_path = format!("{}.{}", path, name);
                    if let Some(value) = build_node(child, &child_path, elements) {
                        map.insert(name.clone(), value);
                    }
                }
            }
            // The root object is always emitted, even when empty
            if map.is_empty() && path != "$" {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        _ => {
            let element = elements.get(path)?;
            if element.state == ElementState::Completed {
                element.output.clone()
            } else {
                None
            }
        }
    }
}
