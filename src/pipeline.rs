pub mod graph;
pub mod pool;
pub mod scheduler;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{
    AdapterRegistry, RunContext, DNSX, HTTPX, KATANA, NAABU, NUCLEI, SHODAN_KEY, SUBFINDER,
    UNCOVER,
};
use crate::output::{Progress, RunReporter};
use crate::store::{ResultStore, DEFAULT_OUTPUT_DIR};
use crate::target::{classify, TargetKind};

pub use graph::{GraphError, Task, TaskGraph};
pub use scheduler::{RunSummary, Scheduler, SchedulerOptions, TaskReport, TaskState};

/// Which set of tools a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Broad: discovery followed by crawling.
    Scan,
    /// Precise: discovery followed by template matching.
    Probe,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Scan => f.write_str("scan"),
            RunMode::Probe => f.write_str("probe"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("target '{target}' is a {kind}, expected an IP address or a domain")]
    Classification { target: String, kind: TargetKind },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A stage of a run: tool name and the tools it waits for.
pub type Stage = (&'static str, &'static [&'static str]);

const DISCOVERY: [Stage; 4] = [
    (NAABU, &[]),
    (SUBFINDER, &[]),
    (DNSX, &[SUBFINDER]),
    (HTTPX, &[DNSX, NAABU]),
];

/// Stages for `mode`, in declaration order.
pub fn plan(mode: RunMode, passive_search: bool) -> Vec<Stage> {
    let mut stages = DISCOVERY.to_vec();
    match mode {
        RunMode::Scan => stages.push((KATANA, &[HTTPX])),
        RunMode::Probe => {
            stages.push((NUCLEI, &[HTTPX]));
            if passive_search {
                stages.push((UNCOVER, &[HTTPX]));
            }
        }
    }
    stages
}

/// Build the validated task graph for `mode` against `ctx`.
pub fn build_graph(
    mode: RunMode,
    ctx: &RunContext,
    registry: &AdapterRegistry,
) -> Result<TaskGraph, PipelineError> {
    if !ctx.kind.is_scannable() {
        return Err(PipelineError::Classification {
            target: ctx.target.clone(),
            kind: ctx.kind,
        });
    }

    let tasks = plan(mode, ctx.credential(SHODAN_KEY).is_some())
        .into_iter()
        .map(|(name, dependencies)| {
            registry
                .get(name)
                .map(|adapter| Task::new(adapter).depends_on(dependencies))
                .ok_or_else(|| GraphError::MissingAdapter(name.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TaskGraph::new(tasks)?)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scheduler: SchedulerOptions,
    pub output_dir: PathBuf,
    /// Binary path overrides keyed by tool name.
    pub tool_paths: HashMap<String, PathBuf>,
    pub progress: Progress,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerOptions::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            tool_paths: HashMap::new(),
            progress: Progress::Silent,
        }
    }
}

/// Classify `target`, build the graph for `mode` and run it with the
/// built-in tools.
///
/// Classification and graph errors are returned before anything runs. Task
/// failures are reported in the summary.
pub async fn run_graph(
    mode: RunMode,
    target: &str,
    credentials: HashMap<String, String>,
    options: &RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineError> {
    let registry = AdapterRegistry::with_builtin(&options.tool_paths);
    run_with_registry(mode, target, credentials, &registry, options, cancel).await
}

pub async fn run_with_registry(
    mode: RunMode,
    target: &str,
    credentials: HashMap<String, String>,
    registry: &AdapterRegistry,
    options: &RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineError> {
    let target = target.trim();
    let ctx = RunContext::new(target, classify(target)).with_credentials(credentials);
    let graph = build_graph(mode, &ctx, registry)?;

    info!(%mode, target, kind = %ctx.kind, output = %options.output_dir.display(), "run planned");

    let reporter = RunReporter::for_progress(options.progress, graph.len());
    let store = Arc::new(ResultStore::new(&options.output_dir));
    let scheduler = Scheduler::new(options.scheduler.clone(), store, Arc::new(reporter));

    Ok(scheduler.run(&graph, Arc::new(ctx), cancel).await)
}
