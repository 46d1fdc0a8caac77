//! Orchestrator: drives a workflow input through the full run pipeline.
//!
//! Pipeline: validate the spec, normalize a bare-string input, validate
//! feasibility (refining the input as needed), organize elements, schedule
//! PDCA execution, assemble the report. Collaborator failures inside
//! element execution degrade to feedback or a partial report; only an
//! invalid spec, an exhausted feasibility budget, or a dependency cycle
//! surface as errors.

use chrono::Utc;
use pdca_engine_sdk::{
    EventReceiver, EventSender, GenerativeStep, InputSource, ToolStep, WorkflowEvent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::assemble::assemble;
use crate::cycle::PdcaCycleEngine;
use crate::error::WorkflowError;
use crate::feasibility::FeasibilityValidator;
use crate::organize::organize;
use crate::schedule::{ElementScheduler, SchedulerState};
use crate::types::{WorkflowInput, WorkflowReport};

/// Instruction for normalizing a bare-string input into structured data
pub const NORMALIZE_INSTRUCTION: &str = "Convert the free-form input text into a structured \
    object capturing the facts, preferences, and constraints it states. Invent nothing that the \
    text does not say.";

/// Tunables for a run; budgets live on the workflow input instead
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Elements executing PDCA cycles at once
    pub max_concurrency: usize,

    /// Event channel capacity; slow subscribers lag rather than block
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            event_capacity: 1000,
        }
    }
}

/// Orchestration engine over injected collaborators.
///
/// Reusable across runs; each call to [`Orchestrator::run`] is an
/// independent run with its own ID and budgets.
pub struct Orchestrator {
    generative: Arc<dyn GenerativeStep>,
    tool: Arc<dyn ToolStep>,
    input_source: Arc<dyn InputSource>,
    config: OrchestratorConfig,
    events: EventSender,
}

impl Orchestrator {
    pub fn new(
        generative: Arc<dyn GenerativeStep>,
        tool: Arc<dyn ToolStep>,
        input_source: Arc<dyn InputSource>,
    ) -> Self {
        Self::with_config(generative, tool, input_source, OrchestratorConfig::default())
    }

    pub fn with_config(
        generative: Arc<dyn GenerativeStep>,
        tool: Arc<dyn ToolStep>,
        input_source: Arc<dyn InputSource>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            generative,
            tool,
            input_source,
            config,
            events,
        }
    }

    /// Subscribe to the structured event stream for observing runs
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Execute one orchestration run to a report.
    pub async fn run(&self, input: WorkflowInput) -> Result<WorkflowReport, WorkflowError> {
        input.target_output.validate()?;

        let run_id = Uuid::new_v4();
        let _ = self.events.send(WorkflowEvent::RunStarted {
            run_id,
            at: Utc::now(),
        });

        let input_data = self.normalize_input(run_id, input.input_data).await;

        // Feasibility runs against the flat element list; cycles in the
        // declared dependencies are rejected right after, before any
        // element executes
        let elements = crate::organize::flatten_elements(&input.target_output);
        let input_data = self
            .feasibility_validator()
            .validate(
                &elements,
                &input_data,
                input.max_attempts.max_input_refinements,
            )
            .await?;

        let organized = organize(&input.target_output)?;
        let order = organized.order.clone();
        let _ = self.events.send(WorkflowEvent::ElementsOrganized {
            total: organized.elements.len(),
            order: order.clone(),
        });

        let mut state = SchedulerState::new(organized, input.max_attempts.max_output_attempts);
        let engine = Arc::new(PdcaCycleEngine::new(
            Arc::clone(&self.generative),
            Arc::clone(&self.tool),
            self.events.clone(),
        ));
        let scheduler =
            ElementScheduler::new(engine, self.events.clone(), self.config.max_concurrency);
        scheduler.execute(&mut state, &input_data).await;

        let assembly = assemble(&input.target_output, &state.into_elements(), &order);
        let _ = self.events.send(WorkflowEvent::RunFinished {
            run_id,
            status: assembly.status,
            at: Utc::now(),
        });

        Ok(WorkflowReport {
            run_id,
            status: assembly.status,
            output: assembly.output,
            unsuccessful: assembly.unsuccessful,
        })
    }

    /// Best-effort normalization of a bare-string input.
    ///
    /// Structured inputs pass through untouched. When normalization fails
    /// the original string is kept; feasibility validation decides whether
    /// it suffices.
    async fn normalize_input(&self, run_id: Uuid, input_data: Value) -> Value {
        let Value::String(text) = input_data else {
            return input_data;
        };
        match self
            .generative
            .invoke(
                NORMALIZE_INSTRUCTION,
                &[],
                &json!({"text": text}),
                &json!({"type": "object"}),
            )
            .await
        {
            Ok(structured) if structured.is_object() => {
                let _ = self.events.send(WorkflowEvent::InputNormalized { run_id });
                structured
            }
            _ => Value::String(text),
        }
    }

    fn feasibility_validator(&self) -> FeasibilityValidator {
        FeasibilityValidator::new(
            Arc::clone(&self.generative),
            Arc::clone(&self.input_source),
            self.events.clone(),
        )
    }
}
