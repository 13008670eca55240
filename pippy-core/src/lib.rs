//! Core types for pippy
//!
//! This crate contains:
//! - Shared domain types (Pipeline, Stage, PipelineRun, etc.) - structure only
//! - The audit record written for every operator action
//!
//! Note: Persistence lives in pippy-store, orchestration logic in
//! pippy-orchestrator.

pub mod audit;
pub mod pipeline;
pub mod run;

pub use audit::AuditRecord;
pub use pipeline::{DatadogInfo, MonitorInfo, Pipeline, Stage, Workflow, WorkflowInfo};
pub use run::{
    PipelineRun, RunState, StageRun, StageRunApproval, StageRunMetadata, StageState,
    TriggerMetadata,
};
