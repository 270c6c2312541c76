//! Multi-agent escalation layer for complex jobs.
//!
//! The [`Supervisor`] is the only holder of worker handles. Each worker is a
//! tokio task with its own `mpsc` inbox; all replies arrive on one shared
//! supervisor channel as [`AgentMessage`]s. Tasks run in dependency order,
//! highest priority first among the ready ones. A worker that stays busy past
//! its timeout is aborted and respawned idle, and its task is requeued once.

pub mod message;
pub mod worker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use adaptcrawl_shared::{
    AdaptError, AgentConfig, AppConfig, ErrorKind, FieldSchema, JobPhase, JobState, SelectorSpec,
    TaskId,
};

pub use message::{
    AgentMessage, AgentRole, MessageBody, MessageKind, Task, TaskKind, TaskOutput, TaskPayload,
    WorkerState,
};
pub use worker::{AgentWorker, Analyst, Explorer, Optimizer, Validator, spawn_worker};

use crate::scorer::ConfidenceScorer;

/// Capacity of the shared reply channel.
const REPLY_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Per-worker performance counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerMetrics {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub busy_time: Duration,
}

impl WorkerMetrics {
    /// Mean execution time of completed tasks.
    pub fn mean_duration(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        self.busy_time / self.completed as u32
    }
}

/// A task that produced no output.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub role: AgentRole,
    pub message: String,
    pub timed_out: bool,
}

impl TaskFailure {
    fn new(task: &Task, message: impl Into<String>, timed_out: bool) -> Self {
        Self {
            task_id: task.task_id,
            kind: task.kind,
            role: AgentRole::for_task(task.kind),
            message: message.into(),
            timed_out,
        }
    }
}

/// Aggregated outcome of [`Supervisor::execute`].
#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub outputs: HashMap<TaskId, TaskOutput>,
    pub failures: Vec<TaskFailure>,
    pub metrics: BTreeMap<AgentRole, WorkerMetrics>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct WorkerSlot {
    worker: Arc<dyn AgentWorker>,
    inbox: mpsc::Sender<AgentMessage>,
    handle: JoinHandle<()>,
    state: WorkerState,
    metrics: WorkerMetrics,
}

struct InFlight {
    order: usize,
    task: Task,
    role: AgentRole,
    started: Instant,
    deadline: Instant,
}

pub struct Supervisor {
    workers: BTreeMap<AgentRole, WorkerSlot>,
    replies_tx: mpsc::Sender<AgentMessage>,
    replies_rx: mpsc::Receiver<AgentMessage>,
    worker_timeout: Duration,
    sample_pages: usize,
    accept_threshold: f64,
    concurrency: usize,
}

impl Supervisor {
    /// Start the four standard workers. Must be called inside a tokio runtime.
    pub fn spawn(config: &AppConfig) -> Self {
        let workers: Vec<Arc<dyn AgentWorker>> = vec![
            Arc::new(Explorer),
            Arc::new(Analyst::new(ConfidenceScorer::new(config.scoring.clone()))),
            Arc::new(Optimizer),
            Arc::new(Validator),
        ];
        let mut supervisor = Self::with_workers(workers, &config.agents);
        supervisor.accept_threshold = config.ladder.accept_threshold;
        supervisor.concurrency = config.executor.max_concurrency;
        supervisor
    }

    /// Start an arbitrary set of workers, one per role.
    pub fn with_workers(workers: Vec<Arc<dyn AgentWorker>>, config: &AgentConfig) -> Self {
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_CAPACITY);
        let workers = workers
            .into_iter()
            .map(|worker| {
                let role = worker.role();
                let (inbox, handle) = spawn_worker(worker.clone(), replies_tx.clone());
                let slot = WorkerSlot {
                    worker,
                    inbox,
                    handle,
                    state: WorkerState::Idle,
                    metrics: WorkerMetrics::default(),
                };
                (role, slot)
            })
            .collect();

        let defaults = AppConfig::default();
        Self {
            workers,
            replies_tx,
            replies_rx,
            worker_timeout: Duration::from_secs(config.worker_timeout_secs),
            sample_pages: config.sample_pages.max(1),
            accept_threshold: defaults.ladder.accept_threshold,
            concurrency: defaults.executor.max_concurrency,
        }
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_accept_threshold(mut self, threshold: f64) -> Self {
        self.accept_threshold = threshold;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn worker_state(&self, role: AgentRole) -> Option<WorkerState> {
        self.workers.get(&role).map(|slot| slot.state)
    }

    pub fn metrics(&self) -> BTreeMap<AgentRole, WorkerMetrics> {
        self.workers
            .iter()
            .map(|(role, slot)| (*role, slot.metrics.clone()))
            .collect()
    }

    /// Run `tasks` to completion.
    ///
    /// Tasks whose dependencies fail, or name unknown tasks, fail without
    /// running. Each role has one worker, so tasks of the same kind run one
    /// at a time while different roles work in parallel.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub async fn execute(&mut self, tasks: Vec<Task>) -> SupervisorReport {
        let known: HashSet<TaskId> = tasks.iter().map(|t| t.task_id).collect();
        let mut pending: Vec<(usize, Task)> = tasks.into_iter().enumerate().collect();
        let mut in_flight: HashMap<TaskId, InFlight> = HashMap::new();
        let mut outputs: HashMap<TaskId, TaskOutput> = HashMap::new();
        let mut failures: Vec<TaskFailure> = Vec::new();
        let mut failed: HashSet<TaskId> = HashSet::new();

        loop {
            drop_unrunnable(&mut pending, &known, &mut failed, &mut failures);

            // Dispatch ready tasks to idle roles.
            let mut busy: HashSet<AgentRole> = in_flight.values().map(|f| f.role).collect();
            let mut ready: Vec<usize> = pending
                .iter()
                .enumerate()
                .filter(|(_, (_, task))| task.depends_on.iter().all(|d| outputs.contains_key(d)))
                .map(|(i, _)| i)
                .collect();
            ready.sort_by(|&a, &b| {
                pending[b]
                    .1
                    .priority
                    .cmp(&pending[a].1.priority)
                    .then(pending[a].0.cmp(&pending[b].0))
            });
            let mut chosen: Vec<usize> = Vec::new();
            for index in ready {
                if busy.insert(AgentRole::for_task(pending[index].1.kind)) {
                    chosen.push(index);
                }
            }
            chosen.sort_unstable_by(|a, b| b.cmp(a));
            let mut batch: Vec<(usize, Task)> = chosen.into_iter().map(|i| pending.remove(i)).collect();
            batch.reverse();

            for (order, task) in batch {
                let upstream: Vec<TaskOutput> = task
                    .depends_on
                    .iter()
                    .filter_map(|d| outputs.get(d).cloned())
                    .collect();
                let role = AgentRole::for_task(task.kind);
                match self.dispatch(role, task.clone(), upstream).await {
                    Ok(()) => {
                        let started = Instant::now();
                        in_flight.insert(
                            task.task_id,
                            InFlight {
                                order,
                                task,
                                role,
                                started,
                                deadline: started + self.worker_timeout,
                            },
                        );
                    }
                    Err(reason) => {
                        failed.insert(task.task_id);
                        failures.push(TaskFailure::new(&task, reason, false));
                    }
                }
            }

            if in_flight.is_empty() {
                if pending.is_empty() {
                    break;
                }
                if pending
                    .iter()
                    .any(|(_, t)| t.depends_on.iter().all(|d| outputs.contains_key(d)))
                {
                    continue;
                }
                for (_, task) in pending.drain(..) {
                    failures.push(TaskFailure::new(&task, "dependency cycle", false));
                }
                break;
            }

            let Some(deadline) = in_flight.values().map(|f| f.deadline).min() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, self.replies_rx.recv()).await {
                Ok(Some(message)) => {
                    let id = message.correlation_id;
                    let Some(role) = in_flight
                        .get(&id)
                        .filter(|f| f.role == message.from)
                        .map(|f| f.role)
                    else {
                        debug!(from = %message.from, task_id = %id, "discarding stale reply");
                        continue;
                    };
                    match message.body {
                        MessageBody::Status(state) => {
                            if let Some(slot) = self.workers.get_mut(&role) {
                                slot.state = state;
                            }
                        }
                        MessageBody::Output(output) => {
                            if let Some(flight) = in_flight.remove(&id) {
                                if let Some(slot) = self.workers.get_mut(&role) {
                                    slot.state = WorkerState::Idle;
                                    slot.metrics.completed += 1;
                                    slot.metrics.busy_time += flight.started.elapsed();
                                }
                                outputs.insert(id, output);
                            }
                        }
                        MessageBody::Failure(reason) => {
                            if let Some(flight) = in_flight.remove(&id) {
                                if let Some(slot) = self.workers.get_mut(&role) {
                                    slot.state = WorkerState::Error;
                                    slot.metrics.failed += 1;
                                }
                                failed.insert(id);
                                failures.push(TaskFailure::new(&flight.task, reason, false));
                            }
                        }
                        MessageBody::Assignment { .. } => {}
                    }
                }
                Ok(None) => {
                    warn!("reply channel closed, abandoning remaining tasks");
                    for (_, flight) in in_flight.drain() {
                        failures.push(TaskFailure::new(&flight.task, "reply channel closed", false));
                    }
                    for (_, task) in pending.drain(..) {
                        failures.push(TaskFailure::new(&task, "reply channel closed", false));
                    }
                    break;
                }
                Err(_) => {
                    let now = Instant::now();
                    let expired: Vec<TaskId> = in_flight
                        .iter()
                        .filter(|(_, f)| f.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in expired {
                        let Some(flight) = in_flight.remove(&id) else {
                            continue;
                        };
                        warn!(role = %flight.role, task_id = %id, "worker timed out, force-resetting");
                        self.reset(flight.role);
                        if let Some(slot) = self.workers.get_mut(&flight.role) {
                            slot.metrics.timed_out += 1;
                        }
                        let mut task = flight.task;
                        if task.retries_left > 0 {
                            task.retries_left -= 1;
                            pending.push((flight.order, task));
                            pending.sort_by_key(|(order, _)| *order);
                        } else {
                            failed.insert(id);
                            failures.push(TaskFailure::new(&task, "worker timed out", true));
                        }
                    }
                }
            }
        }

        info!(
            completed = outputs.len(),
            failed = failures.len(),
            "supervisor run finished"
        );
        SupervisorReport {
            outputs,
            failures,
            metrics: self.metrics(),
        }
    }

    /// Explore, analyze, and optimize on the crawled sample pages.
    ///
    /// Sets `suggested_spec` and `tuning`; failed sub-tasks are recorded as
    /// job errors.
    #[instrument(skip_all, fields(job = %state.name))]
    pub async fn prepare(
        &mut self,
        mut state: JobState,
        schema: &FieldSchema,
        hint: Option<&SelectorSpec>,
    ) -> JobState {
        let pages: Vec<_> = state
            .pending_items
            .iter()
            .take(self.sample_pages)
            .cloned()
            .collect();
        let crawl_errors = state.errors.iter().filter(|e| e.phase == JobPhase::Crawl);
        let fetch_failures = crawl_errors.clone().count();
        let transient_failures = crawl_errors
            .filter(|e| matches!(e.kind, ErrorKind::TransientFetch | ErrorKind::Timeout))
            .count();

        let explore = Task::new(
            TaskKind::Explore,
            TaskPayload::Explore {
                pages: pages.clone(),
                schema: schema.clone(),
                hint: hint.cloned(),
            },
        )
        .with_priority(3);
        let analyze = Task::new(
            TaskKind::Analyze,
            TaskPayload::Analyze {
                pages,
                schema: schema.clone(),
            },
        )
        .with_priority(2)
        .after(explore.task_id);
        let optimize = Task::new(
            TaskKind::Optimize,
            TaskPayload::Optimize {
                pages_fetched: state.pending_items.len(),
                fetch_failures,
                transient_failures,
                current_concurrency: self.concurrency,
                accept_threshold: self.accept_threshold,
            },
        )
        .with_priority(1)
        .after(analyze.task_id);

        let (explore_id, analyze_id, optimize_id) =
            (explore.task_id, analyze.task_id, optimize.task_id);
        let report = self.execute(vec![explore, analyze, optimize]).await;

        let explored = match report.outputs.get(&explore_id) {
            Some(TaskOutput::Explored { spec, .. }) => spec.clone(),
            _ => None,
        };
        let analyzed = match report.outputs.get(&analyze_id) {
            Some(TaskOutput::Analyzed {
                spec,
                mean_confidence,
                ..
            }) => {
                debug!(mean_confidence = *mean_confidence, "sample pages analyzed");
                spec.clone()
            }
            _ => None,
        };
        if let Some(spec) = analyzed.or(explored) {
            state.suggested_spec = Some(spec);
        }
        if let Some(TaskOutput::Optimized(tuning)) = report.outputs.get(&optimize_id) {
            state.tuning = Some(tuning.clone());
        }

        self.record_failures(&mut state, &report.failures);
        info!(
            suggested = state.suggested_spec.is_some(),
            max_concurrency = ?state.tuning.as_ref().and_then(|t| t.max_concurrency),
            "job prepared by agents"
        );
        state
    }

    /// Check the extracted records; every issue becomes a validation error.
    #[instrument(skip_all, fields(job = %state.name))]
    pub async fn validate(&mut self, mut state: JobState, schema: &FieldSchema) -> JobState {
        let task = Task::new(
            TaskKind::Validate,
            TaskPayload::Validate {
                records: state.accepted_items.clone(),
                schema: schema.clone(),
            },
        );
        let task_id = task.task_id;
        let report = self.execute(vec![task]).await;

        if let Some(TaskOutput::Validated { issues }) = report.outputs.get(&task_id) {
            for issue in issues {
                warn!(issue = %issue, "validation issue");
                state.record_error(&AdaptError::validation(issue.clone()), None);
            }
        }
        self.record_failures(&mut state, &report.failures);
        state
    }

    fn record_failures(&self, state: &mut JobState, failures: &[TaskFailure]) {
        for failure in failures {
            let error = if failure.timed_out {
                AdaptError::timeout(format!("{} worker", failure.role), self.worker_timeout)
            } else {
                AdaptError::Internal(format!("{} task failed: {}", failure.role, failure.message))
            };
            state.record_error(&error, None);
        }
    }

    async fn dispatch(
        &mut self,
        role: AgentRole,
        task: Task,
        upstream: Vec<TaskOutput>,
    ) -> std::result::Result<(), String> {
        let Some(slot) = self.workers.get(&role) else {
            return Err(format!("no {role} worker registered"));
        };
        let message = AgentMessage::assign(role, task, upstream);
        let Err(returned) = slot.inbox.send(message).await else {
            return Ok(());
        };

        // The worker loop is gone; respawn and try once more.
        warn!(%role, "worker inbox closed, respawning");
        self.reset(role);
        let Some(slot) = self.workers.get(&role) else {
            return Err(format!("no {role} worker registered"));
        };
        slot.inbox
            .send(returned.0)
            .await
            .map_err(|_| format!("{role} worker is unavailable"))
    }

    /// Abort the worker task for `role` and start a fresh, idle one.
    fn reset(&mut self, role: AgentRole) {
        let Some(slot) = self.workers.get_mut(&role) else {
            return;
        };
        slot.handle.abort();
        let (inbox, handle) = spawn_worker(slot.worker.clone(), self.replies_tx.clone());
        slot.inbox = inbox;
        slot.handle = handle;
        slot.state = WorkerState::Idle;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for slot in self.workers.values() {
            slot.handle.abort();
        }
    }
}

/// Fail pending tasks that depend on failed or unknown tasks, transitively.
fn drop_unrunnable(
    pending: &mut Vec<(usize, Task)>,
    known: &HashSet<TaskId>,
    failed: &mut HashSet<TaskId>,
    failures: &mut Vec<TaskFailure>,
) {
    loop {
        let Some(index) = pending.iter().position(|(_, task)| {
            task.depends_on
                .iter()
                .any(|d| failed.contains(d) || !known.contains(d))
        }) else {
            return;
        };
        let (_, task) = pending.remove(index);
        failed.insert(task.task_id);
        failures.push(TaskFailure::new(&task, "a dependency did not complete", false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use adaptcrawl_crawler::apply_spec;
    use adaptcrawl_shared::{
        FieldValue, Item, JobId, RawPage, Record, Result, StrategyKind, Tuning,
    };

    use crate::testing::{news_page, news_schema, news_spec};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Answer,
        Stall,
        StallOnce,
        Fail,
    }

    struct Scripted {
        behaviour: Behaviour,
        calls: AtomicUsize,
        seen: Mutex<Vec<u8>>,
    }

    impl Scripted {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentWorker for Scripted {
        fn role(&self) -> AgentRole {
            AgentRole::Validator
        }

        async fn handle(&self, task: &Task, _upstream: &[TaskOutput]) -> Result<TaskOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(task.priority);
            let stall = match self.behaviour {
                Behaviour::Stall => true,
                Behaviour::StallOnce => call == 0,
                _ => false,
            };
            if stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if matches!(self.behaviour, Behaviour::Fail) {
                return Err(AdaptError::parse("boom"));
            }
            Ok(TaskOutput::Validated { issues: Vec::new() })
        }
    }

    fn validate_task() -> Task {
        Task::new(
            TaskKind::Validate,
            TaskPayload::Validate {
                records: Vec::new(),
                schema: news_schema(),
            },
        )
    }

    fn supervisor_with(worker: Arc<Scripted>) -> Supervisor {
        Supervisor::with_workers(vec![worker], &AgentConfig::default())
            .with_worker_timeout(Duration::from_millis(100))
    }

    fn record(job: JobId, title: &str, date: &str) -> Record {
        let mut fields = Item::new();
        fields.insert("title".into(), FieldValue::from(title));
        if !date.is_empty() {
            fields.insert("date".into(), FieldValue::from(date));
        }
        Record::new(job, "https://site-a.example/list", fields, 0.9, StrategyKind::Deterministic, false)
    }

    #[tokio::test]
    async fn prepare_suggests_spec_from_sample_pages() {
        let mut supervisor = Supervisor::spawn(&AppConfig::default());
        let mut state = JobState::new(JobId::new(), "site-a", "site-a.example/list", 10);
        state.pending_items = vec![
            RawPage::new("https://site-a.example/list?p=1", 200, news_page()),
            RawPage::new("https://site-a.example/list?p=2", 200, news_page()),
        ];

        let state = supervisor.prepare(state, &news_schema(), None).await;

        let spec = state.suggested_spec.as_ref().expect("suggested spec");
        assert_eq!(spec.item.as_deref(), Some("article.entry"));
        assert_eq!(apply_spec(&news_page(), spec).unwrap().len(), 3);
        let tuning = state.tuning.as_ref().expect("tuning");
        assert_eq!(tuning.max_concurrency, None);
        assert!(!tuning.notes.is_empty());
        assert!(state.errors.is_empty());

        let metrics = supervisor.metrics();
        assert_eq!(metrics[&AgentRole::Explorer].completed, 1);
        assert_eq!(metrics[&AgentRole::Analyst].completed, 1);
        assert_eq!(metrics[&AgentRole::Optimizer].completed, 1);
    }

    #[tokio::test]
    async fn ready_tasks_run_by_priority_after_dependencies() {
        let worker = Scripted::new(Behaviour::Answer);
        let mut supervisor = supervisor_with(worker.clone());

        let first = validate_task().with_priority(0);
        let gated = validate_task().with_priority(9).after(first.task_id);
        let low = validate_task().with_priority(1);
        let high = validate_task().with_priority(5);

        let report = supervisor.execute(vec![gated, first, low, high]).await;

        assert_eq!(report.outputs.len(), 4);
        assert!(report.failures.is_empty());
        // `gated` outranks everything but must wait for `first`.
        assert_eq!(*worker.seen.lock().unwrap(), vec![5, 1, 0, 9]);
    }

    #[tokio::test]
    async fn stuck_worker_is_reset_and_task_requeued_once() {
        let worker = Scripted::new(Behaviour::StallOnce);
        let mut supervisor = supervisor_with(worker.clone());

        let report = supervisor.execute(vec![validate_task()]).await;

        assert_eq!(report.outputs.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.metrics[&AgentRole::Validator].timed_out, 1);
        assert_eq!(supervisor.worker_state(AgentRole::Validator), Some(WorkerState::Idle));
    }

    #[tokio::test]
    async fn always_stuck_task_fails_with_its_dependents() {
        let worker = Scripted::new(Behaviour::Stall);
        let mut supervisor = supervisor_with(worker.clone());

        let root = validate_task();
        let child = validate_task().after(root.task_id);
        let (root_id, child_id) = (root.task_id, child.task_id);
        let report = supervisor.execute(vec![root, child]).await;

        assert!(report.outputs.is_empty());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
        let root_failure = report.failures.iter().find(|f| f.task_id == root_id).unwrap();
        assert!(root_failure.timed_out);
        assert!(report.failures.iter().any(|f| f.task_id == child_id && !f.timed_out));
    }

    #[tokio::test]
    async fn worker_error_is_not_requeued() {
        let worker = Scripted::new(Behaviour::Fail);
        let mut supervisor = supervisor_with(worker.clone());

        let report = supervisor.execute(vec![validate_task()]).await;

        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].message.contains("boom"));
        assert_eq!(supervisor.worker_state(AgentRole::Validator), Some(WorkerState::Error));
    }

    #[tokio::test]
    async fn unknown_dependency_fails_without_running() {
        let worker = Scripted::new(Behaviour::Answer);
        let mut supervisor = supervisor_with(worker.clone());

        let orphan = validate_task().after(TaskId::new());
        let report = supervisor.execute(vec![orphan]).await;

        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn validate_records_issues_as_errors() {
        let mut supervisor = Supervisor::spawn(&AppConfig::default());
        let job = JobId::new();
        let mut state = JobState::new(job, "site-a", "site-a.example/list", 10);
        state.accepted_items = vec![
            record(job, "One", "2024-05-01"),
            record(job, "Two", ""),
            record(job, "Three", "someday"),
            record(job, "one", "2024-05-01"),
        ];

        let state = supervisor.validate(state, &news_schema()).await;

        let messages: Vec<&str> = state.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("1 of 4 records missing required field 'date'")));
        assert!(messages.iter().any(|m| m.contains("invalid Date values in 'date'")));
        assert!(messages.iter().any(|m| m.contains("1 duplicate records")));
        assert!(state.errors.iter().all(|e| e.kind == ErrorKind::Validation));
    }

    #[tokio::test]
    async fn optimizer_halves_concurrency_on_transient_failures() {
        let task = Task::new(
            TaskKind::Optimize,
            TaskPayload::Optimize {
                pages_fetched: 10,
                fetch_failures: 5,
                transient_failures: 4,
                current_concurrency: 4,
                accept_threshold: 0.7,
            },
        );
        let output = Optimizer.handle(&task, &[]).await.unwrap();
        let TaskOutput::Optimized(Tuning {
            max_concurrency,
            notes,
        }) = output
        else {
            panic!("expected an optimizer output");
        };
        assert_eq!(max_concurrency, Some(2));
        assert_eq!(notes.len(), 2);
    }

    #[tokio::test]
    async fn analyst_scores_explored_spec() {
        let task = Task::new(
            TaskKind::Analyze,
            TaskPayload::Analyze {
                pages: vec![RawPage::new("https://site-a.example/list", 200, news_page())],
                schema: news_schema(),
            },
        );
        let upstream = [TaskOutput::Explored {
            spec: Some(news_spec()),
            item_count: 3,
        }];
        let output = Analyst::default().handle(&task, &upstream).await.unwrap();
        let TaskOutput::Analyzed {
            spec,
            mean_confidence,
            pages,
        } = output
        else {
            panic!("expected an analyst output");
        };
        assert_eq!(spec, Some(news_spec()));
        assert_eq!(pages, 1);
        assert!(mean_confidence >= 0.7, "{mean_confidence}");
    }
}
