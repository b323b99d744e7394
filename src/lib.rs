//! Dependency-aware orchestration of external reconnaissance tools.
//!
//! A run classifies its target, builds a task graph for the chosen mode and
//! executes it on a fixed-size worker pool, merging each tool's output into
//! one JSON document as soon as it finishes.

pub mod adapters;
pub mod config;
pub mod output;
pub mod pipeline;
pub mod store;
pub mod target;

pub use adapters::{AdapterError, AdapterRegistry, RunContext, ToolAdapter, ToolKind, Upstream};
pub use pipeline::{run_graph, PipelineError, RunMode, RunOptions, RunSummary, TaskState};
pub use store::{ResultStore, StoreError};
pub use target::{classify, TargetKind};
