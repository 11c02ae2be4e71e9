use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{self, Execution, Store};
use crate::{
    BoxOperator, Completion, DagflowError, Graph, JobSnapshot, Readiness, Result, StateTable,
    Task, TaskOptions, TaskState, Transition,
};

const CANCELLED: &str = "cancelled";

/// What a dispatched unit reports to the coordinator.
enum Report {
    /// A retry finished waiting and is about to call the operator again.
    Started(String),
    Done(Completion),
}

/// A workflow: a set of named tasks plus the graph ordering them.
///
/// Build it with [`Job::add`]/[`Job::add_task`] and [`Job::set_downstream`],
/// then call [`Job::run`]. While a run is in progress, other holders of the
/// job (typically through an `Arc<Job>`) can poll [`Job::snapshot`].
pub struct Job {
    name: String,
    graph: Graph,
    tasks: HashMap<String, Task>,
    state: RwLock<StateTable>,
    store: Option<Arc<dyn Store>>,
    run_lock: Mutex<()>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            tasks: HashMap::new(),
            state: RwLock::new(StateTable::new()),
            store: None,
            run_lock: Mutex::new(()),
        }
    }

    /// Persists an [`Execution`] record to `store` on every state change.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        operator: BoxOperator,
        options: TaskOptions,
    ) -> Result<()> {
        self.add(Task::with_options(name, operator, options))
    }

    pub fn add(&mut self, task: Task) -> Result<()> {
        if task.name().is_empty() {
            return Err(DagflowError::InvalidName);
        }
        if self.tasks.contains_key(task.name()) {
            return Err(DagflowError::DuplicateTask(task.name().to_string()));
        }

        let name = task.name().to_string();
        self.graph.add_node(name.clone());
        self.state.get_mut().insert(name.clone(), task.total_retries());
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Makes `downstream` wait for `upstream` to finish.
    pub fn set_downstream(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        for name in [upstream, downstream] {
            if !self.tasks.contains_key(name) {
                return Err(DagflowError::TaskNotFound(name.to_string()));
            }
        }
        if upstream == downstream {
            return Err(DagflowError::SelfDependency(upstream.to_string()));
        }
        if self.graph.downstream(upstream).iter().any(|d| d == downstream) {
            return Err(DagflowError::DuplicateEdge {
                upstream: upstream.to_string(),
                downstream: downstream.to_string(),
            });
        }

        self.graph.set_downstream(upstream, downstream);
        Ok(())
    }

    pub fn validate(&self) -> bool {
        self.graph.validate()
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        self.state.read().await.snapshot(&self.name)
    }

    /// Every state change applied during the current or last run, in order.
    pub async fn transitions(&self) -> Vec<Transition> {
        self.state.read().await.transitions().to_vec()
    }

    pub async fn task_state(&self, name: &str) -> Option<TaskState> {
        self.state.read().await.state_of(name)
    }

    pub async fn run(&self) -> Result<Execution> {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Runs every task to a terminal state.
    ///
    /// Fails before dispatching anything if the graph has a cycle. Tasks that
    /// fail do not stop the run: their `AllDone` dependents still execute.
    /// When the run ends with failed tasks their names are returned in
    /// [`DagflowError::TasksFailed`].
    pub async fn run_with_cancel(&self, ctx: CancellationToken) -> Result<Execution> {
        if !self.graph.validate() {
            return Err(DagflowError::InvalidDag);
        }
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| DagflowError::AlreadyRunning)?;

        let mut execution = {
            let mut table = self.state.write().await;
            table.reset();
            Execution::new(&self.name, &table)
        };
        info!(job = %self.name, execution_id = %execution.id, "starting job");
        self.persist_new(&execution).await;

        let upstream: HashMap<&str, Vec<String>> = self
            .graph
            .nodes()
            .map(|n| (n, self.graph.dependencies(n)))
            .collect();

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Report>();
        let mut handles = Vec::new();
        // Completions queued or still to be sent by running units.
        let mut in_flight = 0usize;
        // Retries dispatched but still waiting out their policy delay.
        let mut waiting = HashSet::new();

        loop {
            if ctx.is_cancelled() {
                return Err(self.cancelled(&mut execution).await);
            }
            in_flight += self
                .dispatch_ready(&ctx, &upstream, &report_tx, &mut waiting, &mut handles)
                .await;
            if in_flight == 0 {
                break;
            }

            let report = tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(self.cancelled(&mut execution).await);
                }
                Some(report) = report_rx.recv() => report,
            };

            let (task, state, job_state) = {
                let mut table = self.state.write().await;
                match report {
                    Report::Started(task) => {
                        waiting.remove(&task);
                        table.set_state(&task, TaskState::Running);
                        (task, TaskState::Running, table.job_state())
                    }
                    Report::Done(completion) => {
                        in_flight -= 1;
                        table.apply(&completion);
                        (completion.task, completion.state, table.job_state())
                    }
                }
            };
            info!(
                job = %self.name,
                execution_id = %execution.id,
                task = %task,
                state = %state,
                "task update"
            );

            execution.sync(job_state, &task, state);
            self.save(&execution).await;
        }

        // Every unit has already reported; this only reaps the handles.
        join_all(handles).await;

        execution.finished_at = Some(Utc::now());
        self.save(&execution).await;

        let failed = self.state.read().await.failed_tasks();
        info!(
            job = %self.name,
            execution_id = %execution.id,
            state = %execution.state,
            "job done"
        );

        if failed.is_empty() {
            Ok(execution)
        } else {
            Err(DagflowError::TasksFailed(failed))
        }
    }

    /// One readiness scan over every non-terminal task. Returns how many
    /// completions the scan will produce, counting skips.
    ///
    /// In an acyclic graph a scan that produces nothing while nothing is in
    /// flight means every task is terminal. A retry stays `UpForRetry` in the
    /// table until its unit reports [`Report::Started`]; `waiting` keeps the
    /// scan from dispatching it twice.
    async fn dispatch_ready(
        &self,
        ctx: &CancellationToken,
        upstream: &HashMap<&str, Vec<String>>,
        report_tx: &mpsc::UnboundedSender<Report>,
        waiting: &mut HashSet<String>,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> usize {
        let mut table = self.state.write().await;
        let mut produced = 0;

        for name in self.graph.nodes() {
            let Some(task) = self.tasks.get(name) else {
                continue;
            };
            let deps = upstream.get(name).map(Vec::as_slice).unwrap_or(&[]);

            match table.state_of(name) {
                Some(TaskState::None) if deps.is_empty() => {
                    let remaining = table.get(name).map_or(0, |r| r.remaining_attempts);
                    table.set_state(name, TaskState::Running);
                    handles.push(spawn_attempt(ctx, task, None, remaining, report_tx));
                    produced += 1;
                }
                Some(TaskState::UpForRetry) if !waiting.contains(name) => {
                    let attempt = table.take_attempt(name);
                    let remaining = table.get(name).map_or(0, |r| r.remaining_attempts);
                    waiting.insert(name.to_string());
                    handles.push(spawn_attempt(ctx, task, attempt, remaining, report_tx));
                    produced += 1;
                }
                Some(TaskState::None) => {
                    let states = deps
                        .iter()
                        .map(|d| table.state_of(d).unwrap_or(TaskState::None));

                    match task.rule().evaluate(states) {
                        Readiness::Wait => {}
                        Readiness::Run => {
                            let remaining = table.get(name).map_or(0, |r| r.remaining_attempts);
                            table.set_state(name, TaskState::Running);
                            handles.push(spawn_attempt(ctx, task, None, remaining, report_tx));
                            produced += 1;
                        }
                        Readiness::Skip => {
                            table.set_state(name, TaskState::Skipped);
                            // Same completion path as a dispatched attempt.
                            if report_tx.send(Report::Done(task.skip())).is_ok() {
                                produced += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        debug!(job = %self.name, produced, all_done = table.all_done(), "readiness scan");
        produced
    }

    /// Stops dispatching and closes out every unfinished task. In-flight units
    /// keep the token and may observe it; their completions are dropped.
    async fn cancelled(&self, execution: &mut Execution) -> DagflowError {
        let interrupted = {
            let mut table = self.state.write().await;
            let interrupted = table.abandon(CANCELLED);
            execution.sync_all(&table);
            interrupted
        };
        warn!(
            job = %self.name,
            execution_id = %execution.id,
            interrupted = ?interrupted,
            "job cancelled"
        );
        execution.finished_at = Some(Utc::now());
        self.save(execution).await;
        DagflowError::Cancelled
    }

    async fn persist_new(&self, execution: &Execution) {
        if let Some(store) = &self.store {
            if let Err(e) = store::persist_new_execution(store.as_ref(), execution).await {
                warn!(job = %self.name, execution_id = %execution.id, error = %e, "failed to persist execution");
            }
        }
    }

    async fn save(&self, execution: &Execution) {
        if let Some(store) = &self.store {
            if let Err(e) = store::save_execution(store.as_ref(), execution).await {
                warn!(job = %self.name, execution_id = %execution.id, error = %e, "failed to sync execution");
            }
        }
    }
}

/// Spawns one attempt of `task` on its own tokio task. A retry first waits out
/// the task's retry policy and reports [`Report::Started`] once it is over;
/// only this unit sleeps.
fn spawn_attempt(
    ctx: &CancellationToken,
    task: &Task,
    retry_attempt: Option<u32>,
    remaining_attempts: u32,
    report_tx: &mpsc::UnboundedSender<Report>,
) -> JoinHandle<()> {
    let ctx = ctx.clone();
    let task = task.clone();
    let report_tx = report_tx.clone();

    tokio::spawn(async move {
        if let Some(attempt) = retry_attempt {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(task = %task.name(), "retry wait interrupted");
                    return;
                }
                _ = task.policy().wait(task.name(), attempt) => {}
            }
            if report_tx.send(Report::Started(task.name().to_string())).is_err() {
                return;
            }
        }

        let completion = task.attempt(ctx, remaining_attempts).await;

        // The coordinator is gone if the run was cancelled.
        if report_tx.send(Report::Done(completion)).is_err() {
            debug!(task = %task.name(), "completion dropped after run ended");
        }
    })
}
