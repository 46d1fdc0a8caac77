//! Element organization: flattening, dependency graph, processing order.
//!
//! The organizer turns a validated [`TargetOutputSpec`] into schedulable
//! elements, builds the dependency graph from the explicit `depends_on`
//! declarations, rejects cycles before execution begins, and computes a
//! deterministic processing order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CycleError;
use crate::spec::{SpecKind, TargetOutputSpec};
use crate::types::{Element, ElementId, ElementState, Requiredness};

/// Flatten a spec tree into elements.
///
/// Leaf scalars and array nodes become elements; object nodes are assembly
/// points only. Dependencies declared on an object property propagate to
/// every element flattened beneath it.
pub fn flatten_elements(spec: &TargetOutputSpec) -> Vec<Element> {
    let mut elements = Vec::new();
    let mut decl_index = 0usize;
    walk(
        spec,
        "$",
        Requiredness::Required,
        &BTreeSet::new(),
        &mut elements,
        &mut decl_index,
    );
    elements
}

fn walk(
    spec: &TargetOutputSpec,
    path: &str,
    requiredness: Requiredness,
    inherited_deps: &BTreeSet<ElementId>,
    out: &mut Vec<Element>,
    decl_index: &mut usize,
) {
    match spec.kind {
        SpecKind::Object => {
            let Some(props) = spec.properties.as_ref() else {
                return;
            };
            for (name, child) in props {
                let child_path = format!("{}.{}", path, name);
                let child_req = if requiredness == Requiredness::Required
                    && spec.required.iter().any(|r| r == name)
                {
                    Requiredness::Required
                } else {
                    Requiredness::Optional
                };

                let mut deps = inherited_deps.clone();
                for dep_name in &child.depends_on {
                    if let Some(sibling) = props.get(dep_name) {
                        let sibling_path = format!("{}.{}", path, dep_name);
                        deps.extend(element_ids_under(sibling, &sibling_path));
                    }
                }

                if child.kind == SpecKind::Object {
                    walk(child, &child_path, child_req, &deps, out, decl_index);
                } else {
                    push_element(child, child_path, child_req, deps, out, decl_index);
                }
            }
        }
        // Root scalar or root array: a single element
        _ => push_element(
            spec,
            path.to_string(),
            requiredness,
            inherited_deps.clone(),
            out,
            decl_index,
        ),
    }
}

/// IDs of all elements that flattening would produce beneath this node
fn element_ids_under(spec: &TargetOutputSpec, path: &str) -> Vec<ElementId> {
    match spec.kind {
        SpecKind::Object => {
            let mut ids = Vec::new();
            if let Some(props) = spec.properties.as_ref() {
                for (name, child) in props {
                    ids.extend(element_ids_under(child, &format!("{}.{}", path, name)));
                }
            }
            ids
        }
        _ => vec![path.to_string()],
    }
}

fn push_element(
    spec: &TargetOutputSpec,
    id: ElementId,
    requiredness: Requiredness,
    depends_on: BTreeSet<ElementId>,
    out: &mut Vec<Element>,
    decl_index: &mut usize,
) {
    out.push(Element {
        id,
        spec: spec.clone(),
        requiredness,
        priority: spec.priority,
        depends_on,
        decl_index: *decl_index,
        state: ElementState::Waiting,
        attempt_count: 0,
        invalidations: 0,
        last_feedback: Vec::new(),
        attempts: Vec::new(),
        output: None,
    });
    *decl_index += 1;
}

// ============================================================================
// Dependency Graph
// ============================================================================

/// Directed dependency graph over element IDs.
///
/// Must be acyclic before execution begins; a cycle is a hard precondition
/// failure for the run.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// element -> elements it depends on
    deps: BTreeMap<ElementId, BTreeSet<ElementId>>,
    /// element -> elements depending on it
    dependents: BTreeMap<ElementId, BTreeSet<ElementId>>,
}

impl DependencyGraph {
    /// Build adjacency from flattened elements
    pub fn build(elements: &[Element]) -> Self {
        let mut graph = Self::default();
        for element in elements {
            graph
                .deps
                .entry(element.id.clone())
                .or_default()
                .extend(element.depends_on.iter().cloned());
            for dep in &element.depends_on {
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(element.id.clone());
            }
        }
        graph
    }

    /// Elements `id` depends on
    pub fn dependencies_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ElementId> {
        self.deps.get(id).into_iter().flatten()
    }

    /// Elements that declared a dependency on `id`
    pub fn dependents_of<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ElementId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// All elements transitively depending on `id`
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ElementId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ElementId> = self.dependents_of(id).cloned().collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                stack.extend(self.dependents_of(&current).cloned());
            }
        }
        seen
    }

    /// Depth-first cycle detection with recursion-stack marking.
    ///
    /// Returns the members of the first cycle found, in traversal order,
    /// with the entry element repeated at the end.
    pub fn detect_cycle(&self) -> Option<Vec<ElementId>> {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut on_stack: Vec<&str> = Vec::new();

        for start in self.deps.keys() {
            if !visited.contains(start.as_str()) {
                if let Some(cycle) = self.dfs(start, &mut visited, &mut on_stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut BTreeSet<&'a str>,
        on_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<ElementId>> {
        visited.insert(node);
        on_stack.push(node);

        for next in self.dependencies_of(node) {
            if let Some(pos) = on_stack.iter().position(|n| *n == next.as_str()) {
                let mut members: Vec<ElementId> =
                    on_stack[pos..].iter().map(|n| n.to_string()).collect();
                members.push(next.clone());
                return Some(members);
            }
            if !visited.contains(next.as_str()) {
                if let Some(cycle) = self.dfs(next, visited, on_stack) {
                    return Some(cycle);
                }
            }
        }

        on_stack.pop();
        None
    }
}

// ============================================================================
// Processing Order
// ============================================================================

/// Compute a total processing order.
///
/// Dependencies precede dependents; among unconstrained elements, required
/// precedes optional, then priority (high > medium > low), then spec
/// declaration order.
pub fn processing_order(elements: &[Element], graph: &DependencyGraph) -> Vec<ElementId> {
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut order: Vec<ElementId> = Vec::new();

    while order.len() < elements.len() {
        let mut ready: Vec<&Element> = elements
            .iter()
            .filter(|e| {
                !done.contains(e.id.as_str())
                    && graph
                        .dependencies_of(&e.id)
                        .all(|d| done.contains(d.as_str()))
            })
            .collect();
        if ready.is_empty() {
            // Unreachable for acyclic graphs; organize() rejects cycles first
            break;
        }
        ready.sort_by_key(|e| (e.requiredness, e.priority, e.decl_index));
        let next = ready[0];
        done.insert(next.id.as_str());
        order.push(next.id.clone());
    }
    order
}

/// Result of organizing a spec: elements, graph, processing order
#[derive(Debug, Clone)]
pub struct Organized {
    pub elements: Vec<Element>,
    pub graph: DependencyGraph,
    pub order: Vec<ElementId>,
}

/// Organize a validated spec for execution.
///
/// Fails with [`CycleError`] naming the cycle members when the declared
/// dependencies are circular; this is fatal for the run.
pub fn organize(spec: &TargetOutputSpec) -> Result<Organized, CycleError> {
    let elements = flatten_elements(spec);
    let graph = DependencyGraph::build(&elements);
    if let Some(members) = graph.detect_cycle() {
        return Err(CycleError { members });
    }
    let order = processing_order(&elements, &graph);
    Ok(Organized {
        elements,
        graph,
        order,
    })
}
