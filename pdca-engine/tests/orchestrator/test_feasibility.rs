//! Feasibility validation and the input refinement loop

use super::common::*;
use pdca_engine::cycle::PLAN_INSTRUCTION;
use pdca_engine::feasibility::FEASIBILITY_INSTRUCTION;
use pdca_engine::WorkflowError;
use pdca_engine_sdk::{GenerationError, RunStatus};
use serde_json::json;
use std::sync::Arc;

const YEAR_INPUT: &str = r#"
input_source: {type: user}
input_data: {artist: "Coltrane"}
max_attempts: {max_input_refinements: 1, max_output_attempts: 3}
target_output:
  type: object
  required: [year]
  properties:
    year: {type: integer}
"#;

#[tokio::test]
async fn test_refined_input_unblocks_the_run() {
    // Infeasible until the input carries an era
    let generative = StubGenerative::new(|instruction, input| match instruction {
        FEASIBILITY_INSTRUCTION => {
            if input["input_data"]["era"].is_string() {
                feasible()
            } else {
                Ok(json!({"feasible": false, "refinement": "which era or decade?"}))
            }
        }
        PLAN_INSTRUCTION => single_step_plan("produce year"),
        "produce year" => Ok(json!(1957)),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });
    let input_source =
        StubInputSource::with_refinements(vec![json!({"artist": "Coltrane", "era": "late 50s"})]);

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        Arc::clone(&input_source),
    );
    let report = engine.run(workflow_input(YEAR_INPUT)).await.unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.output, json!({"year": 1957}));

    let calls = input_source.refinement_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].element_id, "$.year");
    assert!(calls[0][0].request.contains("era"));
}

#[tokio::test]
async fn test_exhausted_refinement_budget_is_terminal() {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => Ok(json!({"feasible": false, "refinement": "need more"})),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });
    // One refinement allowed, and it does not help
    let input_source = StubInputSource::with_refinements(vec![json!({"still": "not enough"})]);

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        input_source,
    );
    let err = engine.run(workflow_input(YEAR_INPUT)).await.unwrap_err();

    let WorkflowError::Infeasible(report) = err else {
        panic!("expected infeasibility, got: {}", err);
    };
    assert_eq!(report.rounds, 1);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].element_id, "$.year");
    assert_eq!(report.entries[0].refinement_request, "need more");

    // No element ever executed
    assert_eq!(generative.calls_with_instruction(PLAN_INSTRUCTION), 0);
}

#[tokio::test]
async fn test_declining_source_ends_the_loop_early() {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => Ok(json!({"feasible": false, "refinement": "anything"})),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        generative,
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let err = engine.run(workflow_input(YEAR_INPUT)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Infeasible(_)));
}

#[tokio::test]
async fn test_feasible_elements_are_not_revalidated() {
    let generative = StubGenerative::new(|instruction, input| match instruction {
        FEASIBILITY_INSTRUCTION => {
            if input["element_id"] == "$.easy" {
                feasible()
            } else if input["input_data"]["hint"].is_string() {
                feasible()
            } else {
                Ok(json!({"feasible": false, "refinement": "need a hint"}))
            }
        }
        PLAN_INSTRUCTION => single_step_plan("produce"),
        "produce" => Ok(json!("value")),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });
    let input_source = StubInputSource::with_refinements(vec![json!({"hint": "here"})]);

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        input_source,
    );
    engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {}
target_output:
  type: object
  required: [easy, hard]
  properties:
    easy: {type: string}
    hard: {type: string}
"#,
        ))
        .await
        .unwrap();

    // The already-feasible element sat out the second round
    let easy_judgments = generative
        .invocations()
        .into_iter()
        .filter(|(i, input)| i == FEASIBILITY_INSTRUCTION && input["element_id"] == "$.easy")
        .count();
    assert_eq!(easy_judgments, 1);
    let hard_judgments = generative
        .invocations()
        .into_iter()
        .filter(|(i, input)| i == FEASIBILITY_INSTRUCTION && input["element_id"] == "$.hard")
        .count();
    assert_eq!(hard_judgments, 2);
}

#[tokio::test]
async fn test_failed_judgment_counts_as_infeasible() {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => Err(GenerationError::Failed("model offline".to_string())),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        generative,
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let err = engine.run(workflow_input(YEAR_INPUT)).await.unwrap_err();
    let WorkflowError::Infeasible(report) = err else {
        panic!("expected infeasibility");
    };
    assert!(report.entries[0]
        .refinement_request
        .contains("judgment unavailable"));
}
