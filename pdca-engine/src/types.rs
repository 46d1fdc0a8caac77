//! Data types for the PDCA orchestration engine.
//!
//! This module defines the structures that flow through a run:
//!
//! 1. **Workflow Input** - the input snapshot plus attempt budgets
//! 2. **Elements** - schedulable sub-parts of the target output
//! 3. **Work Plans & Attempts** - one Plan/Do/Check/Act pass per attempt
//! 4. **Workflow Report** - final assembly or partial-failure report

use chrono::{DateTime, Utc};
use pdca_engine_sdk::{Example, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::spec::{Priority, SpecError, TargetOutputSpec};

/// Type alias for element IDs (dotted spec paths, e.g. `$.album.year`)
pub type ElementId = String;

// ============================================================================
// Workflow Input Types
// ============================================================================

/// Where the workflow input came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSourceKind {
    User,
    Workflow,
}

/// Reference to the input source, consulted during feasibility refinement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSourceRef {
    /// Kind of source
    #[serde(rename = "type")]
    pub kind: InputSourceKind,

    /// Workflow ID when the source is another workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Retry budgets for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxAttempts {
    /// Input refinement rounds allowed during feasibility validation
    pub max_input_refinements: u32,

    /// PDCA cycles allowed per element
    pub max_output_attempts: u32,
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self {
            max_input_refinements: 3,
            max_output_attempts: 3,
        }
    }
}

/// Immutable snapshot of one orchestration request.
///
/// `input_data` is the exception: it may be replaced wholesale during
/// feasibility refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    /// Origin of the input (for refinement routing)
    pub input_source: InputSourceRef,

    /// Arbitrary structured input data
    pub input_data: Value,

    /// Desired output shape
    pub target_output: TargetOutputSpec,

    /// Retry budgets
    #[serde(default)]
    pub max_attempts: MaxAttempts,
}

impl WorkflowInput {
    /// Parse a workflow input document from JSON, validating the spec
    pub fn from_json_str(s: &str) -> Result<Self, SpecError> {
        let input: WorkflowInput = serde_json::from_str(s)?;
        input.target_output.validate()?;
        Ok(input)
    }

    /// Parse a workflow input document from YAML, validating the spec
    pub fn from_yaml_str(s: &str) -> Result<Self, SpecError> {
        let input: WorkflowInput = serde_yaml::from_str(s)?;
        input.target_output.validate()?;
        Ok(input)
    }
}

// ============================================================================
// Element Types
// ============================================================================

/// Whether an element must be present in a complete result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requiredness {
    Required,
    Optional,
}

/// Scheduler-visible state of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementState {
    /// Not dispatched; may have unmet dependencies
    Waiting,
    /// Currently running PDCA cycles on a worker
    InFlight,
    /// Accepted output recorded
    Completed,
    /// Attempt budget exhausted; terminal
    Abandoned,
    /// Unreachable because a (transitive) dependency was abandoned
    Blocked {
        /// The abandoned element this one transitively depends on
        by: ElementId,
    },
}

/// One schedulable sub-part of the target output.
///
/// Created by the organizer from the spec tree; mutated only by the
/// scheduler coordinator while applying worker results.
#[derive(Debug, Clone)]
pub struct Element {
    /// Dotted-path ID, e.g. `$.album.year`
    pub id: ElementId,

    /// Spec subtree this element must satisfy
    pub spec: TargetOutputSpec,

    /// Required or optional in the assembled output
    pub requiredness: Requiredness,

    /// Scheduling priority
    pub priority: Priority,

    /// Element IDs this element depends on
    pub depends_on: BTreeSet<ElementId>,

    /// Position in spec declaration order (final ordering tie-break)
    pub decl_index: usize,

    /// Current scheduler state
    pub state: ElementState,

    /// Cycles consumed in the current dispatch
    pub attempt_count: u32,

    /// Times this element was moved back to waiting by an upstream
    /// re-acceptance
    pub invalidations: u32,

    /// Feedback from the most recently closed cycle
    pub last_feedback: Vec<String>,

    /// Full attempt history across dispatches
    pub attempts: Vec<Attempt>,

    /// Accepted output, when completed
    pub output: Option<Value>,
}

// ============================================================================
// Work Plan & Attempt Types
// ============================================================================

/// Kind of a work plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Generative,
    Tool,
}

/// One step of a work plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedStep {
    /// Invoke the generative collaborator
    Generative {
        instruction: String,
        #[serde(default)]
        examples: Vec<Example>,
        input: Value,
        response_shape: Value,
    },
    /// Invoke a named tool
    Tool { name: String, input: Value },
}

impl PlannedStep {
    /// Kind of this step
    pub fn kind(&self) -> StepKind {
        match self {
            PlannedStep::Generative { .. } => StepKind::Generative,
            PlannedStep::Tool { .. } => StepKind::Tool,
        }
    }
}

/// Work plan produced by the Plan phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPlan {
    /// Why this plan should succeed (informational, not control-affecting)
    #[serde(default)]
    pub rationale: String,

    /// Ordered steps executed during Do
    pub steps: Vec<PlannedStep>,
}

/// Outcome of executing one planned step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Position in the work plan
    pub index: usize,

    /// Step kind
    pub kind: StepKind,

    /// Output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Whether the single local recovery re-invocation was used
    pub recovered: bool,
}

/// Verdict of the Check phase for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Type and constraint validation passed
    pub structural_pass: bool,

    /// Free-text success criteria judged satisfied
    pub criteria_pass: bool,

    /// Itemized failures and improvement suggestions
    #[serde(default)]
    pub feedback: Vec<String>,
}

impl CheckReport {
    /// Both criteria sets passed
    pub fn passed(&self) -> bool {
        self.structural_pass && self.criteria_pass
    }
}

/// Terminal action of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleAction {
    Accept,
    Retry,
    Abandon,
}

/// One closed Plan/Do/Check/Act pass for an element.
///
/// Never mutated after the cycle closes; retained in the element's attempt
/// history for feedback incorporation and final reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based cycle number within the element's dispatch
    pub cycle_index: u32,

    /// Plan produced this cycle (absent when planning itself failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<WorkPlan>,

    /// Step outcomes from the Do phase
    #[serde(default)]
    pub step_results: Vec<StepOutcome>,

    /// Check verdict (absent when Do aborted and Check was skipped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckReport>,

    /// Action taken at Act
    pub action: CycleAction,

    /// Consolidated feedback carried into the next Plan (check feedback, or
    /// the step execution error when Check was skipped)
    #[serde(default)]
    pub feedback: Vec<String>,

    /// Cycle start time
    pub started_at: DateTime<Utc>,

    /// Cycle close time
    pub finished_at: DateTime<Utc>,
}

/// Terminal result of running one element to completion or abandonment.
///
/// Workers return this to the coordinator; only the coordinator applies it
/// to shared state.
#[derive(Debug, Clone)]
pub struct ElementOutcome {
    pub element_id: ElementId,
    pub accepted: bool,
    pub output: Option<Value>,
    pub attempts: Vec<Attempt>,
    pub final_feedback: Vec<String>,
}

// ============================================================================
// Workflow Report Types
// ============================================================================

/// Why an element ended unsuccessful
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnsuccessfulReason {
    /// The element exhausted its own attempt budget
    MaxAttemptsExceeded,
    /// A (transitive) dependency was abandoned; this element never ran
    BlockedByAbandonedDependency { dependency: ElementId },
}

/// Report entry for an element that did not reach `Completed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsuccessfulElement {
    pub element_id: ElementId,
    pub reason: UnsuccessfulReason,

    /// Full attempt history (empty for blocked elements)
    #[serde(default)]
    pub attempts: Vec<Attempt>,

    /// Feedback from the last closed cycle
    #[serde(default)]
    pub final_feedback: Vec<String>,
}

/// Final result of an orchestration run.
///
/// Callers always receive this (possibly `partial`) or one of the two
/// terminal errors - never a bare collaborator error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Unique ID of this run
    pub run_id: Uuid,

    /// `complete` when every required element was accepted
    pub status: RunStatus,

    /// Structural assembly of accepted element outputs in spec shape
    pub output: Value,

    /// Elements that did not complete, in processing order
    #[serde(default)]
    pub unsuccessful: Vec<UnsuccessfulElement>,
}
