//! PDCA cycle execution for a single element.
//!
//! Drives the per-element state machine
//! `Pending -> Planning -> Doing -> Checking -> {Accepted | NeedsImprovement -> Planning | Abandoned}`:
//!
//! - **Plan**: the generative collaborator produces an ordered work plan
//!   (generative/tool steps plus a rationale) from the element spec, the
//!   dependency outputs, and feedback from the most recent prior attempt.
//! - **Do**: steps execute strictly in sequence; a failed step gets one
//!   local recovery re-invocation; a second failure aborts the cycle with
//!   the error as feedback, skipping Check.
//! - **Check**: deterministic structural validation plus a generative
//!   judgment of the free-text success criteria; both must pass.
//! - **Act**: accept, retry with feedback, or abandon once the attempt
//!   budget is exhausted.

use chrono::Utc;
use pdca_engine_sdk::{EventSender, GenerativeStep, ToolStep, WorkflowEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::check::structural_violations;
use crate::spec::TargetOutputSpec;
use crate::types::{
    Attempt, CheckReport, CycleAction, Element, ElementId, ElementOutcome, PlannedStep,
    StepOutcome, WorkPlan,
};

/// Instruction for the Plan phase generative call
pub const PLAN_INSTRUCTION: &str = "Create a work plan that produces the target element. \
    Return a `rationale` for why the plan should succeed and an ordered `steps` array; each step \
    is either {kind: \"generative\", instruction, input, response_shape} or \
    {kind: \"tool\", name, input}. Incorporate the previous feedback, if any.";

/// Instruction for the criteria judgment during Check
pub const CRITERIA_INSTRUCTION: &str = "Judge whether the output satisfies the success \
    criteria. Return `pass` and, when it does not pass, `feedback` naming the unmet criteria \
    with concrete improvement suggestions.";

fn plan_response_shape() -> Value {
    json!({
        "type": "object",
        "properties": {
            "rationale": {"type": "string"},
            "steps": {"type": "array", "items": {"type": "object"}}
        },
        "required": ["steps"]
    })
}

fn criteria_response_shape() -> Value {
    json!({
        "type": "object",
        "properties": {
            "pass": {"type": "boolean"},
            "feedback": {"type": "string"}
        },
        "required": ["pass"]
    })
}

#[derive(Debug, Deserialize)]
struct CriteriaJudgment {
    pass: bool,
    #[serde(default)]
    feedback: Option<String>,
}

/// Per-dispatch context handed to a worker along with the element
#[derive(Debug, Clone)]
pub struct CycleContext {
    /// Current workflow input data
    pub input_data: Value,

    /// Accepted outputs of this element's dependencies
    pub dependency_outputs: BTreeMap<ElementId, Value>,
}

/// Outcome of the Do phase for one cycle
enum DoOutcome {
    /// All steps succeeded; the final step's output is the candidate
    Compiled(Value),
    /// A step failed after its recovery attempt; Check is skipped
    Failed(String),
}

/// Runs Plan/Do/Check/Act cycles for individual elements.
///
/// Holds the injected collaborators; owns no element state. Workers invoke
/// [`PdcaCycleEngine::run_to_terminal`] and report the outcome back to the
/// scheduler coordinator.
pub struct PdcaCycleEngine {
    generative: Arc<dyn GenerativeStep>,
    tool: Arc<dyn ToolStep>,
    events: EventSender,
}

impl PdcaCycleEngine {
    pub fn new(
        generative: Arc<dyn GenerativeStep>,
        tool: Arc<dyn ToolStep>,
        events: EventSender,
    ) -> Self {
        Self {
            generative,
            tool,
            events,
        }
    }

    /// Run cycles for one element until it is accepted or abandoned.
    ///
    /// `attempt_count` never exceeds `max_output_attempts`; reaching the
    /// bound abandons the element rather than dropping it silently.
    pub async fn run_to_terminal(
        &self,
        element: &Element,
        ctx: &CycleContext,
        max_output_attempts: u32,
    ) -> ElementOutcome {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut prior_feedback: Vec<String> = element.last_feedback.clone();

        if max_output_attempts == 0 {
            let _ = self.events.send(WorkflowEvent::ElementAbandoned {
                element_id: element.id.clone(),
                attempts: 0,
            });
            return ElementOutcome {
                element_id: element.id.clone(),
                accepted: false,
                output: None,
                attempts,
                final_feedback: vec!["no output attempts permitted".to_string()],
            };
        }

        let mut cycle_index: u32 = 0;
        loop {
            cycle_index += 1;
            let _ = self.events.send(WorkflowEvent::CycleStarted {
                element_id: element.id.clone(),
                cycle_index,
            });

            let last_cycle = cycle_index >= max_output_attempts;
            let (attempt, candidate) = self
                .run_cycle(element, ctx, cycle_index, &prior_feedback, last_cycle)
                .await;
            let action = attempt.action;
            let feedback = attempt.feedback.clone();
            attempts.push(attempt);

            match action {
                CycleAction::Accept => {
                    let _ = self.events.send(WorkflowEvent::ElementAccepted {
                        element_id: element.id.clone(),
                        attempts: cycle_index,
                    });
                    return ElementOutcome {
                        element_id: element.id.clone(),
                        accepted: true,
                        output: candidate,
                        attempts,
                        final_feedback: Vec::new(),
                    };
                }
                CycleAction::Retry => {
                    let _ = self.events.send(WorkflowEvent::ElementRetrying {
                        element_id: element.id.clone(),
                        next_cycle: cycle_index + 1,
                    });
                    prior_feedback = feedback;
                }
                CycleAction::Abandon => {
                    let _ = self.events.send(WorkflowEvent::ElementAbandoned {
                        element_id: element.id.clone(),
                        attempts: cycle_index,
                    });
                    return ElementOutcome {
                        element_id: element.id.clone(),
                        accepted: false,
                        output: None,
                        attempts,
                        final_feedback: feedback,
                    };
                }
            }
        }
    }

    /// Run one Plan/Do/Check/Act pass.
    ///
    /// `last_cycle` decides whether NeedsImprovement becomes Retry or
    /// Abandon at the Act phase.
    async fn run_cycle(
        &self,
        element: &Element,
        ctx: &CycleContext,
        cycle_index: u32,
        prior_feedback: &[String],
        last_cycle: bool,
    ) -> (Attempt, Option<Value>) {
        let started_at = Utc::now();
        let needs_improvement = |last: bool| {
            if last {
                CycleAction::Abandon
            } else {
                CycleAction::Retry
            }
        };

        // Plan
        let plan = match self.plan(element, ctx, prior_feedback).await {
            Ok(plan) => plan,
            Err(reason) => {
                return (
                    Attempt {
                        cycle_index,
                        plan: None,
                        step_results: Vec::new(),
                        check: None,
                        action: needs_improvement(last_cycle),
                        feedback: vec![reason],
                        started_at,
                        finished_at: Utc::now(),
                    },
                    None,
                );
            }
        };
        let _ = self.events.send(WorkflowEvent::PlanCreated {
            element_id: element.id.clone(),
            cycle_index,
            steps: plan.steps.len(),
            rationale: plan.rationale.clone(),
        });

        // Do
        let (step_results, do_outcome) = self.do_phase(element, &plan).await;
        let candidate = match do_outcome {
            DoOutcome::Compiled(value) => value,
            DoOutcome::Failed(error) => {
                // Skip Check; the step error is the cycle's feedback
                return (
                    Attempt {
                        cycle_index,
                        plan: Some(plan),
                        step_results,
                        check: None,
                        action: needs_improvement(last_cycle),
                        feedback: vec![error],
                        started_at,
                        finished_at: Utc::now(),
                    },
                    None,
                );
            }
        };

        // Check
        let check = self.check_output(&element.spec, &candidate).await;
        let _ = self.events.send(WorkflowEvent::CheckEvaluated {
            element_id: element.id.clone(),
            cycle_index,
            structural_pass: check.structural_pass,
            criteria_pass: check.criteria_pass,
        });

        // Act
        let (action, feedback) = if check.passed() {
            (CycleAction::Accept, Vec::new())
        } else {
            (needs_improvement(last_cycle), check.feedback.clone())
        };

        (
            Attempt {
                cycle_index,
                plan: Some(plan),
                step_results,
                check: Some(check),
                action,
                feedback,
                started_at,
                finished_at: Utc::now(),
            },
            Some(candidate),
        )
    }

    /// Plan phase: ask the generative collaborator for a work plan
    async fn plan(
        &self,
        element: &Element,
        ctx: &CycleContext,
        prior_feedback: &[String],
    ) -> Result<WorkPlan, String> {
        let plan_input = json!({
            "element_id": element.id,
            "element_spec": element.spec,
            "input_data": ctx.input_data,
            "dependency_outputs": ctx.dependency_outputs,
            "previous_feedback": prior_feedback,
        });

        let raw = self
            .generative
            .invoke(PLAN_INSTRUCTION, &[], &plan_input, &plan_response_shape())
            .await
            .map_err(|e| format!("work plan generation failed: {}", e))?;

        let plan: WorkPlan = serde_json::from_value(raw)
            .map_err(|e| format!("work plan did not conform to the expected shape: {}", e))?;
        if plan.steps.is_empty() {
            return Err("work plan contained no steps".to_string());
        }
        Ok(plan)
    }

    /// Do phase: execute steps in sequence with one local recovery each.
    ///
    /// The compiled candidate output is the final step's output.
    async fn do_phase(&self, element: &Element, plan: &WorkPlan) -> (Vec<StepOutcome>, DoOutcome) {
        let mut step_results = Vec::new();
        let mut candidate = Value::Null;

        for (index, step) in plan.steps.iter().enumerate() {
            match self.execute_step(element, index, step).await {
                Ok((output, recovered)) => {
                    let _ = self.events.send(WorkflowEvent::StepCompleted {
                        element_id: element.id.clone(),
                        step_index: index,
                    });
                    candidate = output.clone();
                    step_results.push(StepOutcome {
                        index,
                        kind: step.kind(),
                        output: Some(output),
                        error: None,
                        recovered,
                    });
                }
                Err(error) => {
                    step_results.push(StepOutcome {
                        index,
                        kind: step.kind(),
                        output: None,
                        error: Some(error.clone()),
                        recovered: false,
                    });
                    return (
                        step_results,
                        DoOutcome::Failed(format!(
                            "step {} failed after one recovery attempt: {}",
                            index, error
                        )),
                    );
                }
            }
        }

        (step_results, DoOutcome::Compiled(candidate))
    }

    /// Execute one step, re-invoking once with the same inputs on failure.
    ///
    /// Returns the output and whether the recovery invocation was used.
    async fn execute_step(
        &self,
        element: &Element,
        index: usize,
        step: &PlannedStep,
    ) -> Result<(Value, bool), String> {
        match self.invoke_step(step).await {
            Ok(output) => Ok((output, false)),
            Err(first_error) => {
                let _ = self.events.send(WorkflowEvent::StepFailed {
                    element_id: element.id.clone(),
                    step_index: index,
                    error: first_error.clone(),
                    recovered: false,
                });
                match self.invoke_step(step).await {
                    Ok(output) => {
                        let _ = self.events.send(WorkflowEvent::StepFailed {
                            element_id: element.id.clone(),
                            step_index: index,
                            error: first_error,
                            recovered: true,
                        });
                        Ok((output, true))
                    }
                    Err(second_error) => Err(second_error),
                }
            }
        }
    }

    async fn invoke_step(&self, step: &PlannedStep) -> Result<Value, String> {
        match step {
            PlannedStep::Generative {
                instruction,
                examples,
                input,
                response_shape,
            } => self
                .generative
                .invoke(instruction, examples, input, response_shape)
                .await
                .map_err(|e| e.to_string()),
            PlannedStep::Tool { name, input } => self
                .tool
                .invoke(name, input)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    /// Check phase: structural requirements plus success criteria.
    ///
    /// Re-checking an unchanged output against unchanged criteria yields
    /// the same verdict.
    pub async fn check_output(&self, spec: &TargetOutputSpec, output: &Value) -> CheckReport {
        let violations = structural_violations(spec, output);
        let structural_pass = violations.is_empty();
        let mut feedback = violations;

        let criteria_pass = match spec.criteria.as_deref() {
            None => true,
            Some(criteria) => {
                let judge_input = json!({
                    "output": output,
                    "criteria": criteria,
                    "description": spec.description,
                });
                match self
                    .generative
                    .invoke(
                        CRITERIA_INSTRUCTION,
                        &[],
                        &judge_input,
                        &criteria_response_shape(),
                    )
                    .await
                    .map(serde_json::from_value::<CriteriaJudgment>)
                {
                    Ok(Ok(judgment)) => {
                        if !judgment.pass {
                            feedback.push(
                                judgment
                                    .feedback
                                    .unwrap_or_else(|| format!("criteria not met: {}", criteria)),
                            );
                        }
                        judgment.pass
                    }
                    Ok(Err(e)) => {
                        feedback.push(format!("criteria judgment was malformed: {}", e));
                        false
                    }
                    Err(e) => {
                        feedback.push(format!("criteria judgment unavailable: {}", e));
                        false
                    }
                }
            }
        };

        CheckReport {
            structural_pass,
            criteria_pass,
            feedback,
        }
    }
}
