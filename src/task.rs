use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::operator::{BoxOperator, Operator};
use crate::retry::{RetryConfig, RetryPolicy};

/// Decides whether a dependent task runs once all its upstream tasks are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TriggerRule {
    /// Run regardless of how upstream tasks ended.
    #[serde(rename = "allDone")]
    AllDone,
    /// Run only if every upstream task succeeded, otherwise skip.
    #[default]
    #[serde(rename = "allSuccessful")]
    AllSuccessful,
}

/// What the coordinator should do with a not-yet-started dependent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Wait,
    Run,
    Skip,
}

impl TriggerRule {
    /// Applies the rule to the current states of a task's upstream tasks.
    ///
    /// Nothing is decided until every upstream task is terminal. `Skipped`
    /// upstream tasks count as done but not successful.
    pub fn evaluate<I>(self, upstream: I) -> Readiness
    where
        I: IntoIterator<Item = TaskState>,
    {
        let mut done = true;
        let mut successful = true;
        for state in upstream {
            done &= state.is_terminal();
            successful &= state == TaskState::Successful;
        }

        match (done, successful, self) {
            (false, _, _) => Readiness::Wait,
            (true, true, _) | (true, false, TriggerRule::AllDone) => Readiness::Run,
            (true, false, TriggerRule::AllSuccessful) => Readiness::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    #[serde(rename = "notstarted")]
    None,
    Running,
    #[serde(rename = "upforretry")]
    UpForRetry,
    Skipped,
    Failed,
    Successful,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Successful | TaskState::Failed | TaskState::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::None => "notstarted",
            TaskState::Running => "running",
            TaskState::UpForRetry => "upforretry",
            TaskState::Skipped => "skipped",
            TaskState::Failed => "failed",
            TaskState::Successful => "successful",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task settings that can be loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub retries: u32,
    pub trigger_rule: TriggerRule,
    pub retry: RetryConfig,
}

/// The outcome of one dispatched attempt, sent back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: String,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// A named operator plus the policies that govern how often and when it runs.
#[derive(Clone)]
pub struct Task {
    name: String,
    operator: BoxOperator,
    trigger_rule: TriggerRule,
    retries: u32,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("trigger_rule", &self.trigger_rule)
            .field("retries", &self.retries)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, operator: impl Operator + 'static) -> Self {
        Self::with_options(name, Arc::new(operator), TaskOptions::default())
    }

    pub fn with_options(
        name: impl Into<String>,
        operator: BoxOperator,
        options: TaskOptions,
    ) -> Self {
        Self {
            name: name.into(),
            operator,
            trigger_rule: options.trigger_rule,
            retries: options.retries,
            retry_policy: options.retry.build(),
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule(&self) -> TriggerRule {
        self.trigger_rule
    }

    pub fn total_retries(&self) -> u32 {
        self.retries
    }

    pub fn policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    /// Runs the operator once and classifies the outcome.
    ///
    /// `remaining_attempts` is the retry budget left at dispatch time: a failure
    /// with budget left becomes `UpForRetry`, otherwise `Failed`. A panicking
    /// operator counts as a failure.
    pub async fn attempt(&self, ctx: CancellationToken, remaining_attempts: u32) -> Completion {
        info!(task = %self.name, "starting task");

        let outcome = AssertUnwindSafe(self.operator.run(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("operator panicked".into()));

        match outcome {
            Ok(result) => {
                info!(
                    task = %self.name,
                    state = %TaskState::Successful,
                    remaining_attempts,
                    %result,
                    "task update"
                );
                Completion {
                    task: self.name.clone(),
                    state: TaskState::Successful,
                    result: Some(result),
                    error: None,
                }
            }
            Err(err) => {
                let state = if remaining_attempts > 0 {
                    TaskState::UpForRetry
                } else {
                    TaskState::Failed
                };
                warn!(
                    task = %self.name,
                    %state,
                    remaining_attempts,
                    error = %err,
                    "task update"
                );
                Completion {
                    task: self.name.clone(),
                    state,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    pub fn skip(&self) -> Completion {
        info!(task = %self.name, state = %TaskState::Skipped, "task update");
        Completion {
            task: self.name.clone(),
            state: TaskState::Skipped,
            result: None,
            error: None,
        }
    }
}
