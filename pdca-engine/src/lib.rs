// Target output spec parsing and validation
pub mod spec;

// Run data model (elements, plans, attempts, reports)
pub mod types;

// Run-level error taxonomy
pub mod error;

// Element flattening, dependency graph, processing order
pub mod organize;

// Structural validation for the Check phase
pub mod check;

// Per-element Plan/Do/Check/Act execution
pub mod cycle;

// Feasibility validation and input refinement
pub mod feasibility;

// Bounded-concurrency element scheduling
pub mod schedule;

// Accepted-output assembly and partial reporting
pub mod assemble;

// Orchestrator entry point
pub mod workflow;

pub use error::WorkflowError;
pub use types::{MaxAttempts, WorkflowInput, WorkflowReport};
pub use workflow::{Orchestrator, OrchestratorConfig};
