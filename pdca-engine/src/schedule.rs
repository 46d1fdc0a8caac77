//! Bounded-concurrency element scheduling.
//!
//! Splits into a synchronous state machine ([`SchedulerState`]) and an async
//! driver ([`ElementScheduler`]). Workers run PDCA cycles on element
//! snapshots and return an [`ElementOutcome`]; only the coordinator mutates
//! shared state, so no element-level locking is needed.
//!
//! Terminal-state effects propagate through the graph:
//! - acceptance readies waiting dependents and invalidates previously
//!   completed ones (once per re-acceptance, bounded by the attempt budget)
//! - abandonment blocks every transitive dependent that has not completed

use futures::stream::{FuturesUnordered, StreamExt};
use pdca_engine_sdk::{EventSender, WorkflowEvent};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::cycle::{CycleContext, PdcaCycleEngine};
use crate::organize::{DependencyGraph, Organized};
use crate::types::{Element, ElementId, ElementOutcome, ElementState};

/// Mutable scheduling state for one run.
///
/// Pure state machine: `ready`, `mark_in_flight`, and `apply_outcome` are
/// synchronous so transition behavior is testable without an executor.
pub struct SchedulerState {
    elements: BTreeMap<ElementId, Element>,
    graph: DependencyGraph,
    max_output_attempts: u32,
}

/// Dependents affected by applying a terminal outcome
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OutcomeEffects {
    /// Completed dependents moved back to waiting by a re-acceptance
    pub invalidated: Vec<ElementId>,

    /// Waiting transitive dependents blocked by an abandonment
    pub blocked: Vec<ElementId>,
}

impl SchedulerState {
    pub fn new(organized: Organized, max_output_attempts: u32) -> Self {
        Self {
            elements: organized
                .elements
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            graph: organized.graph,
            max_output_attempts,
        }
    }

    pub fn max_output_attempts(&self) -> u32 {
        self.max_output_attempts
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Consume the state, yielding final elements for report assembly
    pub fn into_elements(self) -> BTreeMap<ElementId, Element> {
        self.elements
    }

    /// Waiting elements whose dependencies have all completed.
    ///
    /// Ordered required-first, then by priority, then by declaration order,
    /// so dispatch under a concurrency cap follows the processing order.
    pub fn ready(&self) -> Vec<ElementId> {
        let mut ready: Vec<&Element> = self
            .elements
            .values()
            .filter(|e| {
                e.state == ElementState::Waiting
                    && self.graph.dependencies_of(&e.id).all(|d| {
                        self.elements
                            .get(d)
                            .map(|dep| dep.state == ElementState::Completed)
                            .unwrap_or(false)
                    })
            })
            .collect();
        ready.sort_by_key(|e| (e.requiredness, e.priority, e.decl_index));
        ready.into_iter().map(|e| e.id.clone()).collect()
    }

    /// No element is waiting or running
    pub fn is_settled(&self) -> bool {
        self.elements
            .values()
            .all(|e| !matches!(e.state, ElementState::Waiting | ElementState::InFlight))
    }

    pub fn mark_in_flight(&mut self, id: &str) {
        if let Some(element) = self.elements.get_mut(id) {
            element.state = ElementState::InFlight;
            element.attempt_count = 0;
        }
    }

    /// Accepted outputs of `id`'s dependencies, for the worker context
    pub fn dependency_outputs(&self, id: &str) -> BTreeMap<ElementId, Value> {
        self.graph
            .dependencies_of(id)
            .filter_map(|dep| {
                let element = self.elements.get(dep)?;
                let output = element.output.clone()?;
                Some((dep.clone(), output))
            })
            .collect()
    }

    /// Apply a worker's terminal outcome and propagate its effects
    pub fn apply_outcome(&mut self, outcome: ElementOutcome) -> OutcomeEffects {
        if outcome.accepted {
            OutcomeEffects {
                invalidated: self.apply_accept(outcome),
                blocked: Vec::new(),
            }
        } else {
            OutcomeEffects {
                invalidated: Vec::new(),
                blocked: self.apply_abandon(outcome),
            }
        }
    }

    /// Record an acceptance and invalidate previously completed dependents.
    ///
    /// On a first acceptance no dependent has run yet, so invalidation only
    /// fires on re-acceptance after this element was itself invalidated. An
    /// element is moved back to waiting at most once per upstream
    /// re-acceptance, and never past its own invalidation budget; past the
    /// budget the dependent keeps its existing accepted output.
    fn apply_accept(&mut self, outcome: ElementOutcome) -> Vec<ElementId> {
        let id = outcome.element_id.clone();
        if let Some(element) = self.elements.get_mut(&id) {
            element.state = ElementState::Completed;
            element.attempt_count = outcome.attempts.len() as u32;
            element.output = outcome.output;
            element.attempts.extend(outcome.attempts);
            element.last_feedback = Vec::new();
        }

        let mut invalidated = Vec::new();
        let dependents: Vec<ElementId> = self.graph.dependents_of(&id).cloned().collect();
        for dependent_id in dependents {
            let Some(dependent) = self.elements.get_mut(&dependent_id) else {
                continue;
            };
            if dependent.state != ElementState::Completed
                || dependent.invalidations >= self.max_output_attempts
            {
                continue;
            }
            dependent.state = ElementState::Waiting;
            dependent.invalidations += 1;
            dependent.output = None;
            dependent.last_feedback =
                vec![format!("dependency {} produced a new accepted output", id)];
            invalidated.push(dependent_id);
        }
        invalidated
    }

    /// Record an abandonment and block unreachable transitive dependents
    fn apply_abandon(&mut self, outcome: ElementOutcome) -> Vec<ElementId> {
        let id = outcome.element_id.clone();
        if let Some(element) = self.elements.get_mut(&id) {
            element.state = ElementState::Abandoned;
            element.attempt_count = outcome.attempts.len() as u32;
            element.output = None;
            element.attempts.extend(outcome.attempts);
            element.last_feedback = outcome.final_feedback;
        }

        let mut blocked = Vec::new();
        for dependent_id in self.graph.transitive_dependents(&id) {
            let Some(dependent) = self.elements.get_mut(&dependent_id) else {
                continue;
            };
            if dependent.state == ElementState::Waiting {
                dependent.state = ElementState::Blocked { by: id.clone() };
                blocked.push(dependent_id);
            }
        }
        blocked.sort();
        blocked
    }
}

/// Async driver: dispatches ready elements to PDCA workers under a
/// concurrency cap and applies outcomes through the coordinator.
pub struct ElementScheduler {
    engine: Arc<PdcaCycleEngine>,
    events: EventSender,
    max_concurrency: usize,
}

impl ElementScheduler {
    pub fn new(engine: Arc<PdcaCycleEngine>, events: EventSender, max_concurrency: usize) -> Self {
        Self {
            engine,
            events,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run every element to a terminal state.
    ///
    /// Single-coordinator loop: dispatch all ready elements, await the next
    /// completed worker, apply its outcome, repeat until the state settles.
    pub async fn execute(&self, state: &mut SchedulerState, input_data: &Value) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = FuturesUnordered::new();

        loop {
            for id in state.ready() {
                state.mark_in_flight(&id);
                let _ = self.events.send(WorkflowEvent::ElementDispatched {
                    element_id: id.clone(),
                });

                // Snapshot: the worker never touches shared state
                let element = match state.element(&id) {
                    Some(element) => element.clone(),
                    None => continue,
                };
                let ctx = CycleContext {
                    input_data: input_data.clone(),
                    dependency_outputs: state.dependency_outputs(&id),
                };
                let engine = Arc::clone(&self.engine);
                let semaphore = Arc::clone(&semaphore);
                let max_attempts = state.max_output_attempts();

                in_flight.push(async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return ElementOutcome {
                                element_id: element.id.clone(),
                                accepted: false,
                                output: None,
                                attempts: Vec::new(),
                                final_feedback: vec!["scheduler shut down".to_string()],
                            }
                        }
                    };
                    engine.run_to_terminal(&element, &ctx, max_attempts).await
                });
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            let element_id = outcome.element_id.clone();
            let effects = state.apply_outcome(outcome);
            for invalidated in &effects.invalidated {
                let _ = self.events.send(WorkflowEvent::ElementInvalidated {
                    element_id: invalidated.clone(),
                    upstream: element_id.clone(),
                });
            }
            for blocked in &effects.blocked {
                let _ = self.events.send(WorkflowEvent::ElementBlocked {
                    element_id: blocked.clone(),
                    abandoned_dependency: element_id.clone(),
                });
            }
        }
    }
}
