//! The task-state table shared between the coordinator and pollers.
//!
//! Only the coordinator takes the write lock. Pollers take the read lock
//! just long enough to clone a [`JobSnapshot`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::task::{Completion, TaskState};

/// Job state, derived from the states of its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    #[serde(rename = "notstarted")]
    NotStarted,
    Running,
    Successful,
    Failed,
}

impl JobState {
    /// Derives the job state from its task states.
    ///
    /// Terminal with any failure is `Failed`, terminal without one is
    /// `Successful`, untouched is `NotStarted`, anything else is `Running`.
    pub fn derive<I>(states: I) -> JobState
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut all_done = true;
        let mut all_none = true;
        let mut any_failed = false;

        for state in states {
            all_done &= state.is_terminal();
            all_none &= state == TaskState::None;
            any_failed |= state == TaskState::Failed;
        }

        match (all_done, all_none, any_failed) {
            (true, _, true) => JobState::Failed,
            (true, _, false) => JobState::Successful,
            (false, true, _) => JobState::NotStarted,
            (false, false, _) => JobState::Running,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::NotStarted => "notstarted",
            JobState::Running => "running",
            JobState::Successful => "successful",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task's bookkeeping within one run.
///
/// `result` and `error` describe the last attempt: a successful retry clears
/// the error left by the attempt before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub state: TaskState,
    pub retries: u32,
    pub remaining_attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskRecord {
    fn new(name: String, retries: u32) -> Self {
        Self {
            name,
            state: TaskState::None,
            retries,
            remaining_attempts: retries,
            result: None,
            error: None,
        }
    }
}

/// One applied state change, numbered in the order the coordinator applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub task: String,
    pub state: TaskState,
}

/// Point-in-time copy of a job and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub name: String,
    pub state: JobState,
    pub tasks: Vec<TaskRecord>,
}

impl JobSnapshot {
    pub fn task(&self, name: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.task(name).map(|t| t.state)
    }
}

#[derive(Debug, Default)]
pub struct StateTable {
    records: Vec<TaskRecord>,
    index: HashMap<String, usize>,
    transitions: Vec<Transition>,
    state: JobState,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, retries: u32) {
        let name = name.into();
        let record = TaskRecord::new(name.clone(), retries);
        match self.index.get(&name) {
            Some(&ix) => self.records[ix] = record,
            None => {
                self.index.insert(name, self.records.len());
                self.records.push(record);
            }
        }
        self.state = JobState::derive(self.states());
    }

    /// Puts every task back to `None` with a full retry budget.
    pub fn reset(&mut self) {
        for record in &mut self.records {
            *record = TaskRecord::new(std::mem::take(&mut record.name), record.retries);
        }
        self.transitions.clear();
        self.state = JobState::derive(self.states());
    }

    pub fn get(&self, name: &str) -> Option<&TaskRecord> {
        self.index.get(name).map(|&ix| &self.records[ix])
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.get(name).map(|r| r.state)
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn job_state(&self) -> JobState {
        self.state
    }

    pub fn all_done(&self) -> bool {
        self.records.iter().all(|r| r.state.is_terminal())
    }

    pub fn failed_tasks(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.state == TaskState::Failed)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Moves `name` into `state`, logging the transition and recomputing the job
    /// state. Setting a task to the state it already holds is a no-op.
    pub fn set_state(&mut self, name: &str, state: TaskState) -> bool {
        let Some(&ix) = self.index.get(name) else {
            return false;
        };
        if self.records[ix].state == state {
            return false;
        }

        self.records[ix].state = state;
        self.transitions.push(Transition {
            seq: self.transitions.len() as u64,
            task: name.to_string(),
            state,
        });
        self.state = JobState::derive(self.states());
        true
    }

    /// Spends one retry and returns the attempt number handed to the retry
    /// policy: the retries used so far, counted before this one.
    pub fn take_attempt(&mut self, name: &str) -> Option<u32> {
        let ix = *self.index.get(name)?;
        let record = &mut self.records[ix];
        let attempt = record.retries - record.remaining_attempts;
        record.remaining_attempts = record.remaining_attempts.saturating_sub(1);
        Some(attempt)
    }

    pub fn apply(&mut self, completion: &Completion) -> bool {
        if let Some(&ix) = self.index.get(&completion.task) {
            let record = &mut self.records[ix];
            if completion.result.is_some() {
                record.result = completion.result.clone();
            }
            if completion.error.is_some() {
                record.error = completion.error.clone();
            } else if completion.state == TaskState::Successful {
                record.error = None;
            }
        }
        self.set_state(&completion.task, completion.state)
    }

    /// Closes out a run that stopped early. Dispatched tasks become `Failed`
    /// with `reason` as their error; tasks never dispatched become `Skipped`.
    /// Returns the names of the tasks that were still in flight.
    pub fn abandon(&mut self, reason: &str) -> Vec<String> {
        let mut interrupted = Vec::new();
        for ix in 0..self.records.len() {
            let record = &mut self.records[ix];
            let next = match record.state {
                TaskState::None => TaskState::Skipped,
                TaskState::Running | TaskState::UpForRetry => {
                    record.error = Some(reason.to_string());
                    interrupted.push(record.name.clone());
                    TaskState::Failed
                }
                _ => continue,
            };
            let name = record.name.clone();
            self.set_state(&name, next);
        }
        interrupted
    }

    pub fn snapshot(&self, job_name: &str) -> JobSnapshot {
        JobSnapshot {
            name: job_name.to_string(),
            state: self.state,
            tasks: self.records.clone(),
        }
    }

    fn states(&self) -> impl Iterator<Item = TaskState> + '_ {
        self.records.iter().map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    use crate::task::TaskState::{Failed, Running, Skipped, Successful, UpForRetry};

    #[rstest]
    #[case::empty(vec![], JobState::Successful)]
    #[case::untouched(vec![TaskState::None, TaskState::None], JobState::NotStarted)]
    #[case::one_running(vec![Successful, Running], JobState::Running)]
    #[case::waiting_on_retry(vec![Successful, UpForRetry], JobState::Running)]
    #[case::partly_started(vec![Successful, TaskState::None], JobState::Running)]
    #[case::all_successful(vec![Successful, Successful], JobState::Successful)]
    #[case::failed_and_skipped(vec![Successful, Failed, Skipped], JobState::Failed)]
    #[case::failed_but_still_running(vec![Failed, Running], JobState::Running)]
    fn job_state_is_derived(#[case] states: Vec<TaskState>, #[case] expected: JobState) {
        assert_eq!(JobState::derive(states), expected);
    }

    #[test]
    fn set_state_records_transitions_in_order() {
        let mut table = StateTable::new();
        table.insert("a", 0);
        table.insert("b", 0);

        assert!(table.set_state("a", Running));
        assert!(table.set_state("b", Running));
        assert!(!table.set_state("b", Running));
        assert!(table.set_state("a", Successful));
        assert!(!table.set_state("missing", Running));

        let log: Vec<(u64, &str, TaskState)> = table
            .transitions()
            .iter()
            .map(|t| (t.seq, t.task.as_str(), t.state))
            .collect();
        assert_eq!(
            log,
            vec![(0, "a", Running), (1, "b", Running), (2, "a", Successful)]
        );
        assert_eq!(table.job_state(), JobState::Running);
    }

    #[test]
    fn take_attempt_counts_used_retries() {
        let mut table = StateTable::new();
        table.insert("t", 2);

        assert_eq!(table.take_attempt("t"), Some(0));
        assert_eq!(table.get("t").unwrap().remaining_attempts, 1);
        assert_eq!(table.take_attempt("t"), Some(1));
        assert_eq!(table.get("t").unwrap().remaining_attempts, 0);
        assert_eq!(table.take_attempt("missing"), None);
    }

    #[test]
    fn successful_retry_clears_previous_error() {
        let mut table = StateTable::new();
        table.insert("t", 1);
        table.set_state("t", Running);

        table.apply(&Completion {
            task: "t".into(),
            state: UpForRetry,
            result: None,
            error: Some("boom".into()),
        });
        table.apply(&Completion {
            task: "t".into(),
            state: Successful,
            result: Some(json!(2)),
            error: None,
        });

        let record = table.get("t").unwrap();
        assert_eq!(record.state, Successful);
        assert_eq!(record.result, Some(json!(2)));
        assert_eq!(record.error, None);
        assert_eq!(table.job_state(), JobState::Successful);
    }

    #[test]
    fn failed_retry_keeps_last_error() {
        let mut table = StateTable::new();
        table.insert("t", 1);
        table.set_state("t", Running);

        for (state, error) in [(UpForRetry, "first"), (Failed, "second")] {
            table.apply(&Completion {
                task: "t".into(),
                state,
                result: None,
                error: Some(error.into()),
            });
        }

        assert_eq!(table.get("t").unwrap().error.as_deref(), Some("second"));
    }

    #[test]
    fn abandon_closes_every_unfinished_task() {
        let mut table = StateTable::new();
        for name in ["done", "running", "retrying", "pending"] {
            table.insert(name, 1);
        }
        table.set_state("done", Successful);
        table.set_state("running", Running);
        table.set_state("retrying", UpForRetry);

        let interrupted = table.abandon("cancelled");

        assert_eq!(interrupted, vec!["running", "retrying"]);
        assert_eq!(table.state_of("done"), Some(Successful));
        assert_eq!(table.state_of("running"), Some(Failed));
        assert_eq!(table.state_of("retrying"), Some(Failed));
        assert_eq!(table.state_of("pending"), Some(Skipped));
        assert_eq!(table.get("running").unwrap().error.as_deref(), Some("cancelled"));
        assert_eq!(table.get("pending").unwrap().error, None);
        assert!(table.all_done());
        assert_eq!(table.job_state(), JobState::Failed);
    }

    #[test]
    fn reset_restores_fresh_records() {
        let mut table = StateTable::new();
        table.insert("t", 3);
        table.set_state("t", Running);
        table.take_attempt("t");
        table.set_state("t", Failed);

        table.reset();

        let record = table.get("t").unwrap();
        assert_eq!(record.name, "t");
        assert_eq!(record.state, TaskState::None);
        assert_eq!(record.remaining_attempts, 3);
        assert!(table.transitions().is_empty());
        assert_eq!(table.job_state(), JobState::NotStarted);
        assert_eq!(table.failed_tasks(), Vec::<String>::new());
    }

    #[test]
    fn snapshot_serializes_wire_names() {
        let mut table = StateTable::new();
        table.insert("t", 0);

        let snap = table.snapshot("job");
        assert_eq!(snap.task_state("t"), Some(TaskState::None));

        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["state"], json!("notstarted"));
        assert_eq!(v["tasks"][0]["state"], json!("notstarted"));
    }
}
