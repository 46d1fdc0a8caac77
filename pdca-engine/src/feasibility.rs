//! Feasibility validation and the input refinement loop.
//!
//! Before any element executes, every element is judged against the current
//! input: can a conforming output plausibly be produced from this input?
//! Infeasible elements yield refinement requests that are sent, unioned, to
//! the input source; a refined input re-enters validation. Elements already
//! judged feasible are not re-validated after a refinement.
//!
//! The loop ends either with a (possibly refined) input everything is
//! feasible against, or with an [`InfeasibilityReport`] once the refinement
//! budget runs out. Either way, execution starts with full budgets; the
//! refinement budget is separate from the per-element cycle budget.

use pdca_engine_sdk::{
    EventSender, GenerativeStep, InputSource, RefinementRequest, WorkflowEvent,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{InfeasibilityReport, InfeasibleElement};
use crate::types::Element;

/// Instruction for the per-element feasibility judgment
pub const FEASIBILITY_INSTRUCTION: &str = "Judge whether a conforming output for the target \
    element can plausibly be produced from the given input data. Return `feasible`; when it is \
    false, also return `refinement` describing what additional or corrected input would make \
    the element feasible.";

fn feasibility_response_shape() -> Value {
    json!({
        "type": "object",
        "properties": {
            "feasible": {"type": "boolean"},
            "refinement": {"type": "string"}
        },
        "required": ["feasible"]
    })
}

#[derive(Debug, Deserialize)]
struct FeasibilityJudgment {
    feasible: bool,
    #[serde(default)]
    refinement: Option<String>,
}

/// Validates element feasibility and drives input refinement.
pub struct FeasibilityValidator {
    generative: Arc<dyn GenerativeStep>,
    input_source: Arc<dyn InputSource>,
    events: EventSender,
}

impl FeasibilityValidator {
    pub fn new(
        generative: Arc<dyn GenerativeStep>,
        input_source: Arc<dyn InputSource>,
        events: EventSender,
    ) -> Self {
        Self {
            generative,
            input_source,
            events,
        }
    }

    /// Validate all elements, refining the input as needed.
    ///
    /// Returns the input execution should proceed with. Fails only when the
    /// refinement budget is exhausted (or the input source will not refine)
    /// with elements still infeasible.
    pub async fn validate(
        &self,
        elements: &[Element],
        input_data: &Value,
        max_input_refinements: u32,
    ) -> Result<Value, InfeasibilityReport> {
        let mut input = input_data.clone();
        let mut pending: Vec<&Element> = elements.iter().collect();
        let mut refinements_used: u32 = 0;
        let mut round: u32 = 0;

        loop {
            round += 1;
            let _ = self.events.send(WorkflowEvent::FeasibilityRound {
                round,
                pending: pending.len(),
            });

            let mut infeasible: Vec<(&Element, String)> = Vec::new();
            for &element in &pending {
                if let Some(request) = self.judge(element, &input).await {
                    infeasible.push((element, request));
                }
            }

            if infeasible.is_empty() {
                return Ok(input);
            }

            if refinements_used >= max_input_refinements {
                return Err(self.report(refinements_used, &infeasible));
            }

            let requests: Vec<RefinementRequest> = infeasible
                .iter()
                .map(|(element, request)| RefinementRequest {
                    element_id: element.id.clone(),
                    request: request.clone(),
                })
                .collect();
            let _ = self.events.send(WorkflowEvent::RefinementRequested {
                round,
                elements: requests.iter().map(|r| r.element_id.clone()).collect(),
            });

            match self.input_source.request_refinement(&input, &requests).await {
                Ok(refined) => {
                    refinements_used += 1;
                    input = refined;
                    let _ = self.events.send(WorkflowEvent::InputRefined { round });
                    // Feasible elements stay feasible; only re-validate the rest
                    pending = infeasible.into_iter().map(|(element, _)| element).collect();
                }
                Err(_) => {
                    // The source cannot or will not refine; the budget is moot
                    return Err(self.report(refinements_used, &infeasible));
                }
            }
        }
    }

    /// Judge one element; `Some(request)` means infeasible.
    ///
    /// A failed or malformed judgment counts as infeasible so a flaky
    /// collaborator cannot wave an element through.
    async fn judge(&self, element: &Element, input: &Value) -> Option<String> {
        let judge_input = json!({
            "element_id": element.id,
            "element_spec": element.spec,
            "input_data": input,
        });
        match self
            .generative
            .invoke(
                FEASIBILITY_INSTRUCTION,
                &[],
                &judge_input,
                &feasibility_response_shape(),
            )
            .await
            .map(serde_json::from_value::<FeasibilityJudgment>)
        {
            Ok(Ok(judgment)) if judgment.feasible => None,
            Ok(Ok(judgment)) => Some(judgment.refinement.unwrap_or_else(|| {
                format!("input is insufficient to produce {}", element.id)
            })),
            Ok(Err(e)) => Some(format!("feasibility judgment was malformed: {}", e)),
            Err(e) => Some(format!("feasibility judgment unavailable: {}", e)),
        }
    }

    fn report(&self, rounds: u32, infeasible: &[(&Element, String)]) -> InfeasibilityReport {
        let entries: Vec<InfeasibleElement> = infeasible
            .iter()
            .map(|(element, request)| InfeasibleElement {
                element_id: element.id.clone(),
                refinement_request: request.clone(),
            })
            .collect();
        let _ = self.events.send(WorkflowEvent::InfeasibilityReported {
            elements: entries.iter().map(|e| e.element_id.clone()).collect(),
        });
        InfeasibilityReport { rounds, entries }
    }
}
