//! Run-level error taxonomy.
//!
//! Only two failures abort a run: a dependency cycle and an exhausted
//! feasibility budget. Everything else (step failures, validation failures,
//! exhausted element budgets) degrades to feedback or a partial report and
//! is represented in the data model, not here.

use serde::{Deserialize, Serialize};

use crate::spec::SpecError;
use crate::types::ElementId;

/// Fatal: the dependency graph contains a cycle.
///
/// Detected before any element executes; names every element on the
/// detected cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("circular element dependency: {}", members.join(" -> "))]
pub struct CycleError {
    /// Elements on the cycle, in traversal order
    pub members: Vec<ElementId>,
}

/// One element that remained infeasible after the refinement budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfeasibleElement {
    pub element_id: ElementId,

    /// Most recent refinement request for this element
    pub refinement_request: String,
}

/// Terminal: input refinement budget exhausted with elements still
/// infeasible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("input infeasible after {rounds} refinement round(s): {}", entries.iter().map(|e| e.element_id.as_str()).collect::<Vec<_>>().join(", "))]
pub struct InfeasibilityReport {
    /// Refinement rounds consumed
    pub rounds: u32,

    /// Infeasible elements with their latest refinement requests
    pub entries: Vec<InfeasibleElement>,
}

/// Errors surfaced to the orchestrator caller
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The target output spec is ill-formed (definition error)
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),

    /// Feasibility validation exhausted its refinement budget
    #[error(transparent)]
    Infeasible(#[from] InfeasibilityReport),

    /// The element dependency graph contains a cycle
    #[error(transparent)]
    DependencyCycle(#[from] CycleError),
}
