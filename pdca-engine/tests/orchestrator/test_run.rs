//! End-to-end runs: retries, recovery, partial results, events

use super::common::*;
use pdca_engine::cycle::{CRITERIA_INSTRUCTION, PLAN_INSTRUCTION};
use pdca_engine::feasibility::FEASIBILITY_INSTRUCTION;
use pdca_engine::types::UnsuccessfulReason;
use pdca_engine::workflow::NORMALIZE_INSTRUCTION;
use pdca_engine_sdk::{GenerationError, RunStatus, WorkflowEvent};
use serde_json::json;
use std::sync::{Arc, Mutex};

const ALBUM_INPUT: &str = r#"
input_source: {type: user}
input_data: {genre: rock, era: "1970s"}
target_output:
  type: object
  required: [album]
  properties:
    album:
      type: object
      required: [title, year]
      properties:
        title: {type: string}
        year: {type: integer, constraints: {minimum: 1900, maximum: 2025}}
"#;

#[tokio::test]
async fn test_structural_failure_retried_with_feedback() {
    let year_calls = Arc::new(Mutex::new(0usize));
    let year_calls_in_handler = Arc::clone(&year_calls);
    let generative = StubGenerative::new(move |instruction, input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => {
            let id = input["element_id"].as_str().unwrap();
            single_step_plan(&format!("produce {}", id))
        }
        "produce $.album.title" => Ok(json!("Blue Train")),
        "produce $.album.year" => {
            let mut calls = year_calls_in_handler.lock().unwrap();
            *calls += 1;
            // First attempt violates the year's minimum constraint
            if *calls == 1 {
                Ok(json!(1899))
            } else {
                Ok(json!(1975))
            }
        }
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let report = engine.run(workflow_input(ALBUM_INPUT)).await.unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert!(report.unsuccessful.is_empty());
    assert_eq!(
        report.output,
        json!({"album": {"title": "Blue Train", "year": 1975}})
    );

    // Two cycles for the year: the second plan carries the check feedback
    let plan_calls = generative.plan_calls_for("$.album.year");
    assert_eq!(plan_calls.len(), 2);
    assert!(plan_calls[0]["previous_feedback"]
        .as_array()
        .unwrap()
        .is_empty());
    let feedback = plan_calls[1]["previous_feedback"].to_string();
    assert!(feedback.contains("below minimum"), "feedback: {}", feedback);

    assert_eq!(generative.plan_calls_for("$.album.title").len(), 1);
}

#[tokio::test]
async fn test_criteria_failure_retried_until_judged_satisfied() {
    let judge_calls = Arc::new(Mutex::new(0usize));
    let judge_calls_in_handler = Arc::clone(&judge_calls);
    let generative = StubGenerative::new(move |instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => single_step_plan("write review"),
        "write review" => Ok(json!("a fine record")),
        CRITERIA_INSTRUCTION => {
            let mut calls = judge_calls_in_handler.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(json!({"pass": false, "feedback": "mention the rhythm section"}))
            } else {
                Ok(json!({"pass": true}))
            }
        }
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let report = engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {album: "Blue Train"}
target_output:
  type: object
  required: [review]
  properties:
    review:
      type: string
      criteria: mentions the rhythm section
"#,
        ))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(generative.plan_calls_for("$.review").len(), 2);
    let second_plan = &generative.plan_calls_for("$.review")[1];
    assert!(second_plan["previous_feedback"]
        .to_string()
        .contains("rhythm section"));
}

#[tokio::test]
async fn test_independent_failures_produce_partial_report() {
    let generative = StubGenerative::new(|instruction, input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => {
            let id = input["element_id"].as_str().unwrap();
            single_step_plan(&format!("produce {}", id))
        }
        // Both elements expect integers; strings fail the structural check
        _ if instruction.starts_with("produce") => Ok(json!("not a number")),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let report = engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {}
max_attempts: {max_input_refinements: 3, max_output_attempts: 1}
target_output:
  type: object
  required: [first, second]
  properties:
    first: {type: integer}
    second: {type: integer}
"#,
        ))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.output, json!({}));
    assert_eq!(report.unsuccessful.len(), 2);
    for entry in &report.unsuccessful {
        assert_eq!(entry.reason, UnsuccessfulReason::MaxAttemptsExceeded);
        // Budget of one: exactly one closed cycle each
        assert_eq!(entry.attempts.len(), 1);
        assert!(!entry.final_feedback.is_empty());
    }
}

#[tokio::test]
async fn test_bare_string_input_is_normalized_before_feasibility() {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        NORMALIZE_INSTRUCTION => Ok(json!({"genre": "rock", "era": "1970s"})),
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => single_step_plan("produce title"),
        "produce title" => Ok(json!("Exile")),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let report = engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: "a rock album from the 1970s"
target_output:
  type: object
  required: [title]
  properties:
    title: {type: string}
"#,
        ))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(generative.calls_with_instruction(NORMALIZE_INSTRUCTION), 1);

    // Downstream phases see the structured form, not the raw text
    let (_, feasibility_input) = generative
        .invocations()
        .into_iter()
        .find(|(i, _)| i == FEASIBILITY_INSTRUCTION)
        .unwrap();
    assert_eq!(feasibility_input["input_data"]["genre"], "rock");
}

#[tokio::test]
async fn test_tool_step_output_feeds_assembly() -> anyhow::Result<()> {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => Ok(json!({
            "steps": [{
                "kind": "tool",
                "name": "catalog_lookup",
                "input": {"field": "title"}
            }]
        })),
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });
    let tool = StubTool::new(|name, _input| {
        assert_eq!(name, "catalog_lookup");
        Ok(json!("From The Vault"))
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        Arc::clone(&tool),
        StubInputSource::declining(),
    );
    let report = engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {}
target_output:
  type: object
  required: [title]
  properties:
    title: {type: string}
"#,
        ))
        .await?;

    assert_eq!(report.output, json!({"title": "From The Vault"}));
    assert_eq!(tool.invocations().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_step_recovers_without_a_new_cycle() {
    let step_calls = Arc::new(Mutex::new(0usize));
    let step_calls_in_handler = Arc::clone(&step_calls);
    let generative = StubGenerative::new(move |instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => single_step_plan("produce value"),
        "produce value" => {
            let mut calls = step_calls_in_handler.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Err(GenerationError::Failed("transient".to_string()))
            } else {
                Ok(json!("recovered"))
            }
        }
        other => Err(GenerationError::Failed(format!(
            "unexpected instruction: {}",
            other
        ))),
    });

    let engine = orchestrator(
        Arc::clone(&generative),
        StubTool::unused(),
        StubInputSource::declining(),
    );
    let report = engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {}
target_output:
  type: object
  required: [value]
  properties:
    value: {type: string}
"#,
        ))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.output, json!({"value": "recovered"}));
    // Recovery happened inside the Do phase, not via a second cycle
    assert_eq!(generative.plan_calls_for("$.value").len(), 1);
}

#[tokio::test]
async fn test_event_stream_reports_run_lifecycle() {
    let generative = StubGenerative::new(|instruction, _input| match instruction {
        FEASIBILITY_INSTRUCTION => feasible(),
        PLAN_INSTRUCTION => single_step_plan("produce value"),
        "produce value" => Ok(json!("done")),
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
    let mut events = engine.subscribe_events();
    engine
        .run(workflow_input(
            r#"
input_source: {type: user}
input_data: {}
target_output:
  type: object
  required: [value]
  properties:
    value: {type: string}
"#,
        ))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, WorkflowEvent::ElementsOrganized { total: 1, .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, WorkflowEvent::PlanCreated { .. })));
    assert!(seen.iter().any(
        |e| matches!(e, WorkflowEvent::ElementAccepted { attempts: 1, .. })
    ));
    assert!(matches!(
        seen.last(),
        Some(WorkflowEvent::RunFinished {
            status: RunStatus::Complete,
            ..
        })
    ));
}
