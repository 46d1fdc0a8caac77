// Re-export async trait for convenience
pub use async_trait::async_trait;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One (input, output) demonstration pair supplied alongside a generative
/// instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input: Value,
    pub output: Value,
}

impl Example {
    pub fn new(input: Value, output: Value) -> Self {
        Self { input, output }
    }
}

/// A single refinement request produced during feasibility validation.
///
/// Names the element that could not be derived from the current input and
/// describes what additional or corrected input is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRequest {
    pub element_id: String,
    pub request: String,
}

/// Error from a generative step invocation
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The underlying capability failed outright (transport, model, ...)
    #[error("generative step failed: {0}")]
    Failed(String),
    /// Output was produced but did not conform to the requested shape
    #[error("generative output did not conform to the requested shape: {0}")]
    NonConforming(String),
}

/// Error from a tool step invocation
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    Unknown(String),
    #[error("tool '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Error from an input refinement request
#[derive(Debug, thiserror::Error)]
pub enum RefinementError {
    #[error("input source unavailable: {0}")]
    Unavailable(String),
    #[error("input source declined refinement: {0}")]
    Declined(String),
}

/// External capability that maps (instruction, examples, input) to a
/// structured output conforming to `response_shape`.
///
/// The orchestration engine treats this as an injected judgment/generation
/// primitive so its own control flow stays deterministic and testable with a
/// stub implementation.
#[async_trait]
pub trait GenerativeStep: Send + Sync {
    async fn invoke(
        &self,
        instruction: &str,
        examples: &[Example],
        input: &Value,
        response_shape: &Value,
    ) -> Result<Value, GenerationError>;
}

/// External capability that executes a named function-like operation.
#[async_trait]
pub trait ToolStep: Send + Sync {
    async fn invoke(&self, name: &str, input: &Value) -> Result<Value, ToolError>;
}

/// Channel back to whoever supplied the workflow input, used only during
/// feasibility refinement. May be another workflow or a human in the loop.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Request a refined input. The returned value replaces the current
    /// input data wholesale.
    async fn request_refinement(
        &self,
        current_input: &Value,
        requests: &[RefinementRequest],
    ) -> Result<Value, RefinementError>;
}

/// Final status of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every required element was accepted
    Complete,
    /// At least one required element ended unsuccessful
    Partial,
}

/// Structured events emitted by the engine over a broadcast channel.
///
/// Subscribers (a TUI, an audit log, a test harness) receive these in real
/// time; emission is best-effort and never blocks the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Run started
    RunStarted {
        run_id: Uuid,
        at: DateTime<Utc>,
    },
    /// String input was normalized into structured input (best effort)
    InputNormalized {
        run_id: Uuid,
    },
    /// Feasibility round started
    FeasibilityRound {
        round: u32,
        pending: usize,
    },
    /// Refinement requested from the input source
    RefinementRequested {
        round: u32,
        elements: Vec<String>,
    },
    /// Input data replaced after a refinement round
    InputRefined {
        round: u32,
    },
    /// Feasibility budget exhausted with elements still infeasible
    InfeasibilityReported {
        elements: Vec<String>,
    },
    /// Elements flattened and ordered for execution
    ElementsOrganized {
        total: usize,
        order: Vec<String>,
    },
    /// Element handed to a worker
    ElementDispatched {
        element_id: String,
    },
    /// One PDCA cycle started for an element
    CycleStarted {
        element_id: String,
        cycle_index: u32,
    },
    /// Plan phase produced a work plan
    PlanCreated {
        element_id: String,
        cycle_index: u32,
        steps: usize,
        rationale: String,
    },
    /// A work plan step completed
    StepCompleted {
        element_id: String,
        step_index: usize,
    },
    /// A work plan step failed (recovered=true means the one local retry
    /// succeeded)
    StepFailed {
        element_id: String,
        step_index: usize,
        error: String,
        recovered: bool,
    },
    /// Check phase verdict for one cycle
    CheckEvaluated {
        element_id: String,
        cycle_index: u32,
        structural_pass: bool,
        criteria_pass: bool,
    },
    /// Element accepted
    ElementAccepted {
        element_id: String,
        attempts: u32,
    },
    /// Element will retry with feedback from the closed cycle
    ElementRetrying {
        element_id: String,
        next_cycle: u32,
    },
    /// Element exhausted its attempt budget
    ElementAbandoned {
        element_id: String,
        attempts: u32,
    },
    /// Previously completed element moved back to waiting because an
    /// upstream dependency was re-accepted
    ElementInvalidated {
        element_id: String,
        upstream: String,
    },
    /// Element made unreachable by an abandoned dependency
    ElementBlocked {
        element_id: String,
        abandoned_dependency: String,
    },
    /// Run finished
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

/// Broadcast sender type used by the engine for event emission
pub type EventSender = tokio::sync::broadcast::Sender<WorkflowEvent>;

/// Broadcast receiver type returned to event subscribers
pub type EventReceiver = tokio::sync::broadcast::Receiver<WorkflowEvent>;
