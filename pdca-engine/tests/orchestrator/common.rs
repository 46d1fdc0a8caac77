//! Shared stub collaborators for orchestrator tests

use pdca_engine::cycle::PLAN_INSTRUCTION;
use pdca_engine::types::WorkflowInput;
use pdca_engine::{Orchestrator, OrchestratorConfig};
use pdca_engine_sdk::{
    async_trait, Example, GenerationError, GenerativeStep, InputSource, RefinementError,
    RefinementRequest, ToolError, ToolStep,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type GenerativeHandler = Box<dyn Fn(&str, &Value) -> Result<Value, GenerationError> + Send + Sync>;

/// Generative stub: routes on the instruction, records every invocation
pub struct StubGenerative {
    handler: GenerativeHandler,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl StubGenerative {
    pub fn new(
        handler: impl Fn(&str, &Value) -> Result<Value, GenerationError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }

    /// Plan-phase invocations recorded for a given element
    pub fn plan_calls_for(&self, element_id: &str) -> Vec<Value> {
        self.invocations()
            .into_iter()
            .filter(|(instruction, input)| {
                instruction == PLAN_INSTRUCTION && input["element_id"] == element_id
            })
            .map(|(_, input)| input)
            .collect()
    }

    pub fn calls_with_instruction(&self, instruction: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|(i, _)| i == instruction)
            .count()
    }
}

#[async_trait]
impl GenerativeStep for StubGenerative {
    async fn invoke(
        &self,
        instruction: &str,
        _examples: &[Example],
        input: &Value,
        _response_shape: &Value,
    ) -> Result<Value, GenerationError> {
        self.invocations
            .lock()
            .unwrap()
            .push((instruction.to_string(), input.clone()));
        (self.handler)(instruction, input)
    }
}

type ToolHandler = Box<dyn Fn(&str, &Value) -> Result<Value, ToolError> + Send + Sync>;

/// Tool stub with invocation recording
pub struct StubTool {
    handler: ToolHandler,
    invocations: Mutex<Vec<(String, Value)>>,
}

impl StubTool {
    pub fn new(
        handler: impl Fn(&str, &Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Tool that rejects every invocation, for runs that must not use tools
    pub fn unused() -> Arc<Self> {
        Self::new(|name, _| Err(ToolError::Unknown(name.to_string())))
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolStep for StubTool {
    async fn invoke(&self, name: &str, input: &Value) -> Result<Value, ToolError> {
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_string(), input.clone()));
        (self.handler)(name, input)
    }
}

/// Input source stub: hands out queued refined inputs, then declines
pub struct StubInputSource {
    refined_inputs: Mutex<Vec<Value>>,
    requests_seen: Mutex<Vec<Vec<RefinementRequest>>>,
}

impl StubInputSource {
    pub fn with_refinements(refined_inputs: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            refined_inputs: Mutex::new(refined_inputs),
            requests_seen: Mutex::new(Vec::new()),
        })
    }

    /// A source that never refines
    pub fn declining() -> Arc<Self> {
        Self::with_refinements(Vec::new())
    }

    pub fn refinement_calls(&self) -> Vec<Vec<RefinementRequest>> {
        self.requests_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl InputSource for StubInputSource {
    async fn request_refinement(
        &self,
        _current_input: &Value,
        requests: &[RefinementRequest],
    ) -> Result<Value, RefinementError> {
        self.requests_seen.lock().unwrap().push(requests.to_vec());
        let mut queue = self.refined_inputs.lock().unwrap();
        if queue.is_empty() {
            Err(RefinementError::Declined(
                "no further refinement available".to_string(),
            ))
        } else {
            Ok(queue.remove(0))
        }
    }
}

/// Parse a workflow input document, panicking on definition errors
pub fn workflow_input(yaml: &str) -> WorkflowInput {
    WorkflowInput::from_yaml_str(yaml).unwrap()
}

pub fn orchestrator(
    generative: Arc<StubGenerative>,
    tool: Arc<StubTool>,
    input_source: Arc<StubInputSource>,
) -> Orchestrator {
    // Single worker keeps dispatch deterministic for assertions
    Orchestrator::with_config(
        generative,
        tool,
        input_source,
        OrchestratorConfig {
            max_concurrency: 1,
            event_capacity: 1000,
        },
    )
}

/// A feasibility judgment that waves the element through
pub fn feasible() -> Result<Value, GenerationError> {
    Ok(json!({"feasible": true}))
}

/// A plan with a single generative step carrying a routable instruction
pub fn single_step_plan(instruction: &str) -> Result<Value, GenerationError> {
    Ok(json!({
        "rationale": "one generative step suffices",
        "steps": [{
            "kind": "generative",
            "instruction": instruction,
            "input": {},
            "response_shape": {}
        }]
    }))
}
