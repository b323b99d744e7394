use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::graph::TaskGraph;
use super::pool::{Completion, Job, Outcome, WorkerEnv, WorkerPool};
use crate::adapters::{RunContext, Upstream};
use crate::output::RunReporter;
use crate::store::ResultStore;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Skipped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub task_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// Final state of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub state: TaskState,
    /// Failure message, skip reason or "not applicable".
    pub detail: Option<String>,
    /// Time spent in a worker; `None` if the task never ran.
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub target: String,
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.name == name).map(|t| t.state)
    }

    pub fn succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Done)
    }
}

/// Drives a [`TaskGraph`] to completion on a [`WorkerPool`].
pub struct Scheduler {
    options: SchedulerOptions,
    store: Arc<ResultStore>,
    reporter: Arc<RunReporter>,
}

/// Scheduling state for one run. Only the scheduler loop touches it.
struct RunState<'g> {
    graph: &'g TaskGraph,
    states: Vec<TaskState>,
    remaining: Vec<usize>,
    payloads: Vec<Option<Arc<Value>>>,
    details: Vec<Option<String>>,
    elapsed: Vec<Option<Duration>>,
    outstanding: usize,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g TaskGraph) -> Self {
        let n = graph.len();
        Self {
            graph,
            states: vec![TaskState::Pending; n],
            remaining: graph.tasks().iter().map(|t| t.dependencies.len()).collect(),
            payloads: vec![None; n],
            details: vec![None; n],
            elapsed: vec![None; n],
            outstanding: 0,
        }
    }

    fn upstream(&self, index: usize) -> Upstream {
        let mut upstream = Upstream::new();
        for dependency in &self.graph.task(index).dependencies {
            let Some(dep) = self.graph.index_of(dependency) else {
                continue;
            };
            if let Some(payload) = &self.payloads[dep] {
                upstream.insert(dependency.clone(), Arc::clone(payload));
            }
        }
        upstream
    }

    /// Mark `index` done and return the dependents that became eligible.
    fn complete(&mut self, index: usize) -> Vec<usize> {
        self.states[index] = TaskState::Done;
        let mut ready = Vec::new();
        for &dependent in self.graph.dependents(index) {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.states[dependent] == TaskState::Pending {
                ready.push(dependent);
            }
        }
        ready
    }

    /// Skip every pending task reachable from `failed`.
    fn skip_dependents(&mut self, failed: usize, reporter: &RunReporter) {
        let reason = format!("dependency '{}' failed", self.graph.task(failed).name);
        let mut stack: Vec<usize> = self.graph.dependents(failed).to_vec();
        while let Some(index) = stack.pop() {
            if self.states[index] != TaskState::Pending {
                continue;
            }
            self.skip(index, &reason, reporter);
            stack.extend_from_slice(self.graph.dependents(index));
        }
    }

    fn skip_pending(&mut self, reason: &str, reporter: &RunReporter) {
        let graph = self.graph;
        for &index in graph.topological_order() {
            if self.states[index] == TaskState::Pending {
                self.skip(index, reason, reporter);
            }
        }
    }

    fn skip(&mut self, index: usize, reason: &str, reporter: &RunReporter) {
        let name = &self.graph.task(index).name;
        debug!(task = %name, reason, "task skipped");
        reporter.task_skipped(name, reason);
        self.states[index] = TaskState::Skipped;
        self.details[index] = Some(reason.to_string());
    }

    fn fail(&mut self, index: usize, error: String, reporter: &RunReporter) {
        reporter.task_failed(&self.graph.task(index).name, &error);
        self.states[index] = TaskState::Failed;
        self.details[index] = Some(error);
        self.skip_dependents(index, reporter);
    }

    fn into_reports(self) -> Vec<TaskReport> {
        self.graph
            .tasks()
            .iter()
            .zip(self.states)
            .zip(self.details)
            .zip(self.elapsed)
            .map(|(((task, state), detail), elapsed)| TaskReport {
                name: task.name.clone(),
                state,
                detail,
                elapsed,
            })
            .collect()
    }
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, store: Arc<ResultStore>, reporter: Arc<RunReporter>) -> Self {
        Self {
            options,
            store,
            reporter,
        }
    }

    /// Run every task of `graph` and return once each one is terminal.
    ///
    /// A task is released only after all of its dependencies are `Done`.
    /// A failure skips every task that transitively depends on it; the other
    /// branches keep going. Once `cancel` fires nothing new is started,
    /// pending tasks are skipped and running tools are told to stop.
    pub async fn run(
        &self,
        graph: &TaskGraph,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let started = Instant::now();
        let target = ctx.target.clone();
        let mut run = RunState::new(graph);

        info!(
            target = %target,
            tasks = graph.len(),
            workers = self.options.workers,
            "starting run"
        );
        self.reporter.set_total(graph.len());

        if graph.is_empty() {
            self.reporter.finish();
            return RunSummary {
                target,
                tasks: Vec::new(),
                elapsed: started.elapsed(),
            };
        }

        let (completions_tx, mut completions) = mpsc::unbounded_channel::<Completion>();
        let pool = WorkerPool::spawn(
            self.options.workers,
            graph.len(),
            WorkerEnv {
                ctx,
                store: Arc::clone(&self.store),
                reporter: Arc::clone(&self.reporter),
                task_timeout: self.options.task_timeout,
                cancel: cancel.clone(),
                completions: completions_tx,
            },
        );

        let mut ready: VecDeque<usize> = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&i| run.remaining[i] == 0)
            .collect();
        let mut cancel_seen = false;
        let mut stop_reason = "run cancelled";

        loop {
            while !cancel.is_cancelled() {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                let task = graph.task(index);
                debug!(task = %task.name, "dispatching task");
                run.states[index] = TaskState::Running;
                run.outstanding += 1;

                let job = Job {
                    index,
                    name: task.name.clone(),
                    adapter: Arc::clone(&task.adapter),
                    upstream: run.upstream(index),
                };
                if pool.submit(job).await.is_err() {
                    warn!(task = %task.name, "worker pool closed before task could start");
                    run.outstanding -= 1;
                    run.fail(index, "worker pool closed".to_string(), &self.reporter);
                }
            }

            if cancel.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                warn!("run cancelled, skipping pending tasks");
                ready.clear();
                run.skip_pending("run cancelled", &self.reporter);
            }

            if run.outstanding == 0 {
                break;
            }

            let completion = tokio::select! {
                completion = completions.recv() => completion,
                _ = cancel.cancelled(), if !cancel_seen => continue,
            };
            let Some(completion) = completion else {
                warn!("all workers exited with tasks still running");
                stop_reason = "worker pool exited";
                break;
            };

            run.outstanding -= 1;
            let index = completion.index;
            let name = &graph.task(index).name;
            run.elapsed[index] = Some(completion.elapsed);

            match completion.outcome {
                Outcome::Done(payload) => {
                    debug!(task = %name, "task done");
                    self.reporter.task_done(name, completion.elapsed);
                    run.payloads[index] = Some(payload);
                    ready.extend(run.complete(index));
                }
                Outcome::NotApplicable => {
                    self.reporter.task_not_applicable(name);
                    run.details[index] = Some("not applicable".to_string());
                    ready.extend(run.complete(index));
                }
                Outcome::Failed(failure) => {
                    debug!(task = %name, error = %failure, "task failed");
                    run.fail(index, failure.to_string(), &self.reporter);
                }
            }
        }

        // Only reachable with work left if the run was cancelled or the
        // workers vanished.
        run.skip_pending(stop_reason, &self.reporter);
        for index in 0..graph.len() {
            if run.states[index] == TaskState::Running {
                run.fail(index, "worker exited".to_string(), &self.reporter);
            }
        }

        pool.shutdown().await;
        self.reporter.finish();

        let summary = RunSummary {
            target,
            tasks: run.into_reports(),
            elapsed: started.elapsed(),
        };
        info!(
            target = %summary.target,
            done = summary.count(TaskState::Done),
            failed = summary.count(TaskState::Failed),
            skipped = summary.count(TaskState::Skipped),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterError, AdapterResult, ToolAdapter, ToolKind};
    use crate::pipeline::graph::Task;
    use crate::target::TargetKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone)]
    struct Run {
        name: String,
        start: Instant,
        end: Instant,
        upstream: Vec<String>,
    }

    #[derive(Default)]
    struct Recorder {
        running: AtomicUsize,
        max_running: AtomicUsize,
        runs: StdMutex<Vec<Run>>,
    }

    impl Recorder {
        fn runs(&self) -> Vec<Run> {
            self.runs.lock().unwrap().clone()
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Unsupported,
    }

    struct Fake {
        name: &'static str,
        delay: Duration,
        behaviour: Behaviour,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl ToolAdapter for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ToolKind {
            ToolKind::PortScan
        }

        fn description(&self) -> &str {
            "test double"
        }

        fn supports(&self, _target: TargetKind) -> bool {
            !matches!(self.behaviour, Behaviour::Unsupported)
        }

        async fn run(
            &self,
            _ctx: &RunContext,
            upstream: &Upstream,
            _cancel: &CancellationToken,
        ) -> AdapterResult<Value> {
            let now = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.max_running.fetch_max(now, Ordering::SeqCst);
            let start = Instant::now();

            tokio::time::sleep(self.delay).await;

            self.recorder.running.fetch_sub(1, Ordering::SeqCst);
            self.recorder.runs.lock().unwrap().push(Run {
                name: self.name.to_string(),
                start,
                end: Instant::now(),
                upstream: upstream.tools().map(str::to_string).collect(),
            });

            match self.behaviour {
                Behaviour::Fail => Err(AdapterError::ExitStatus {
                    tool: self.name.to_string(),
                    code: Some(1),
                    stderr: "broke".to_string(),
                }),
                Behaviour::Panic => panic!("{} crashed", self.name),
                _ => Ok(json!({ "tool": self.name })),
            }
        }
    }

    struct Harness {
        recorder: Arc<Recorder>,
        dir: tempfile::TempDir,
        store: Arc<ResultStore>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(ResultStore::new(dir.path().join("out")));
            Self {
                recorder: Arc::new(Recorder::default()),
                dir,
                store,
            }
        }

        fn task(&self, name: &'static str, deps: &[&str], delay_ms: u64, behaviour: Behaviour) -> Task {
            Task::new(Arc::new(Fake {
                name,
                delay: Duration::from_millis(delay_ms),
                behaviour,
                recorder: Arc::clone(&self.recorder),
            }))
            .depends_on(deps)
        }

        fn ok(&self, name: &'static str, deps: &[&str]) -> Task {
            self.task(name, deps, 20, Behaviour::Succeed)
        }

        fn scheduler(&self, workers: usize, timeout: Duration) -> Scheduler {
            Scheduler::new(
                SchedulerOptions {
                    workers,
                    task_timeout: timeout,
                },
                Arc::clone(&self.store),
                Arc::new(RunReporter::hidden()),
            )
        }

        async fn run(&self, tasks: Vec<Task>, workers: usize) -> RunSummary {
            let graph = TaskGraph::new(tasks).unwrap();
            self.scheduler(workers, Duration::from_secs(10))
                .run(&graph, ctx(), CancellationToken::new())
                .await
        }
    }

    fn ctx() -> Arc<RunContext> {
        Arc::new(RunContext::new("example.com", TargetKind::Domain))
    }

    fn broad(h: &Harness) -> Vec<Task> {
        vec![
            h.ok("naabu", &[]),
            h.ok("subfinder", &[]),
            h.ok("dnsx", &["subfinder"]),
            h.ok("httpx", &["dnsx", "naabu"]),
            h.ok("katana", &["httpx"]),
        ]
    }

    #[tokio::test]
    async fn test_happy_path_runs_each_task_once() {
        let h = Harness::new();
        let summary = h.run(broad(&h), 3).await;

        assert!(summary.succeeded());
        assert_eq!(summary.tasks.len(), 5);

        let mut names: Vec<_> = h.recorder.runs().into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["dnsx", "httpx", "katana", "naabu", "subfinder"]);

        let doc = h.store.load().await.unwrap();
        assert_eq!(doc.len(), 5);
        assert_eq!(doc["katana"], json!({"tool": "katana"}));
    }

    #[tokio::test]
    async fn test_tasks_start_after_dependencies_finish() {
        let h = Harness::new();
        let tasks = broad(&h);
        let deps: HashMap<String, Vec<String>> = tasks
            .iter()
            .map(|t| (t.name.clone(), t.dependencies.clone()))
            .collect();

        h.run(tasks, 4).await;

        let runs: HashMap<String, Run> = h
            .recorder
            .runs()
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        for (name, dependencies) in &deps {
            for dependency in dependencies {
                assert!(
                    runs[name].start >= runs[dependency].end,
                    "{} started before {} finished",
                    name,
                    dependency
                );
            }
        }
    }

    #[tokio::test]
    async fn test_upstream_holds_direct_dependencies() {
        let h = Harness::new();
        h.run(broad(&h), 2).await;

        let httpx = h.recorder.runs().into_iter().find(|r| r.name == "httpx").unwrap();
        assert_eq!(httpx.upstream, vec!["dnsx", "naabu"]);
        let naabu = h.recorder.runs().into_iter().find(|r| r.name == "naabu").unwrap();
        assert!(naabu.upstream.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let h = Harness::new();
        let tasks = vec![
            h.task("a", &[], 40, Behaviour::Succeed),
            h.task("b", &[], 40, Behaviour::Succeed),
            h.task("c", &[], 40, Behaviour::Succeed),
            h.task("d", &[], 40, Behaviour::Succeed),
            h.task("e", &[], 40, Behaviour::Succeed),
            h.task("f", &[], 40, Behaviour::Succeed),
        ];

        let summary = h.run(tasks, 2).await;

        assert_eq!(summary.count(TaskState::Done), 6);
        // independent tasks overlap, but never beyond the pool size
        assert_eq!(h.recorder.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_worker_runs_sequentially() {
        let h = Harness::new();
        let summary = h.run(broad(&h), 1).await;

        assert!(summary.succeeded());
        assert_eq!(h.recorder.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let h = Harness::new();
        let tasks = vec![
            h.ok("naabu", &[]),
            h.task("subfinder", &[], 10, Behaviour::Fail),
            h.ok("dnsx", &["subfinder"]),
            h.ok("httpx", &["dnsx", "naabu"]),
            h.ok("katana", &["httpx"]),
            h.ok("uncover", &[]),
        ];

        let summary = h.run(tasks, 3).await;

        assert_eq!(summary.state_of("subfinder"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("dnsx"), Some(TaskState::Skipped));
        assert_eq!(summary.state_of("httpx"), Some(TaskState::Skipped));
        assert_eq!(summary.state_of("katana"), Some(TaskState::Skipped));
        assert_eq!(summary.state_of("naabu"), Some(TaskState::Done));
        assert_eq!(summary.state_of("uncover"), Some(TaskState::Done));
        assert!(!summary.succeeded());

        let failed = summary.tasks.iter().find(|t| t.name == "subfinder").unwrap();
        assert_eq!(
            failed.detail.as_deref(),
            Some("subfinder exited with status 1: broke")
        );
        let skipped = summary.tasks.iter().find(|t| t.name == "katana").unwrap();
        assert!(skipped.elapsed.is_none());

        let doc = h.store.load().await.unwrap();
        assert!(doc.contains_key("naabu"));
        assert!(!doc.contains_key("subfinder"));
        assert!(!doc.contains_key("dnsx"));
    }

    #[tokio::test]
    async fn test_not_applicable_counts_as_done() {
        let h = Harness::new();
        let tasks = vec![
            h.task("subfinder", &[], 10, Behaviour::Unsupported),
            h.ok("dnsx", &["subfinder"]),
        ];

        let summary = h.run(tasks, 2).await;

        assert_eq!(summary.state_of("subfinder"), Some(TaskState::Done));
        assert_eq!(summary.state_of("dnsx"), Some(TaskState::Done));

        let runs = h.recorder.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].upstream.is_empty());

        let doc = h.store.load().await.unwrap();
        assert!(!doc.contains_key("subfinder"));
        assert!(doc.contains_key("dnsx"));
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let h = Harness::new();
        let graph = TaskGraph::new(vec![
            h.task("nuclei", &[], 5_000, Behaviour::Succeed),
            h.ok("katana", &["nuclei"]),
        ])
        .unwrap();

        let summary = h
            .scheduler(2, Duration::from_millis(50))
            .run(&graph, ctx(), CancellationToken::new())
            .await;

        assert_eq!(summary.state_of("nuclei"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("katana"), Some(TaskState::Skipped));
        let nuclei = summary.tasks.iter().find(|t| t.name == "nuclei").unwrap();
        assert!(nuclei.detail.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_store_failure_fails_task() {
        let h = Harness::new();
        // a regular file where the output directory should be
        let blocker = h.dir.path().join("blocked");
        std::fs::write(&blocker, "").unwrap();
        let store = Arc::new(ResultStore::new(&blocker));
        let scheduler = Scheduler::new(
            SchedulerOptions::default(),
            store,
            Arc::new(RunReporter::hidden()),
        );

        let graph = TaskGraph::new(vec![h.ok("naabu", &[]), h.ok("httpx", &["naabu"])]).unwrap();
        let summary = scheduler.run(&graph, ctx(), CancellationToken::new()).await;

        assert_eq!(summary.state_of("naabu"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("httpx"), Some(TaskState::Skipped));
    }

    #[tokio::test]
    async fn test_cancel_skips_pending_tasks() {
        let h = Harness::new();
        let graph = TaskGraph::new(vec![
            h.task("naabu", &[], 5_000, Behaviour::Succeed),
            h.ok("httpx", &["naabu"]),
        ])
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let summary = h
            .scheduler(2, Duration::from_secs(10))
            .run(&graph, ctx(), cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(summary.state_of("naabu"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("httpx"), Some(TaskState::Skipped));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let h = Harness::new();
        let graph = TaskGraph::new(broad(&h)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h
            .scheduler(3, Duration::from_secs(10))
            .run(&graph, ctx(), cancel)
            .await;

        assert_eq!(summary.count(TaskState::Skipped), 5);
        assert!(h.recorder.runs().is_empty());
    }

    #[tokio::test]
    async fn test_lost_workers_end_the_run() {
        let h = Harness::new();
        let tasks = vec![
            h.task("naabu", &[], 10, Behaviour::Panic),
            h.ok("subfinder", &[]),
            h.ok("dnsx", &["subfinder"]),
        ];

        // the only worker dies on its first task
        let summary = h.run(tasks, 1).await;

        assert_eq!(summary.state_of("naabu"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("subfinder"), Some(TaskState::Failed));
        assert_eq!(summary.state_of("dnsx"), Some(TaskState::Skipped));
        let dnsx = summary.tasks.iter().find(|t| t.name == "dnsx").unwrap();
        assert_eq!(dnsx.detail.as_deref(), Some("worker pool exited"));
    }

    #[tokio::test]
    async fn test_empty_graph_finishes() {
        let h = Harness::new();
        let reporter = Arc::new(RunReporter::hidden());
        let scheduler = Scheduler::new(
            SchedulerOptions::default(),
            Arc::clone(&h.store),
            Arc::clone(&reporter),
        );

        let graph = TaskGraph::new(Vec::new()).unwrap();
        let summary = scheduler.run(&graph, ctx(), CancellationToken::new()).await;

        assert!(summary.tasks.is_empty());
        assert!(summary.succeeded());
        assert!(reporter.is_finished());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
    }
}
