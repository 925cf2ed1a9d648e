//! Per-task attempt lifecycle and retry decisions.
//!
//! State machine per task: `Scheduled -> Running -> {Succeeded, Failed}`;
//! a failure leads either back to `Scheduled` for a fresh attempt or to
//! `Abandoned` once the budget is exhausted or the category is not
//! retryable. `Succeeded` and `Abandoned` are terminal.
//!
//! Retry semantics:
//! - failure reports are deduplicated by attempt id; only the first report
//!   for the current attempt acts;
//! - task-granularity retries require every upstream exchange input to
//!   still resolve; otherwise the failure escalates to a whole-query
//!   restart that invalidates all spooled output;
//! - backoff is a per-task ready-at deadline, so cancellation never has a
//!   sleeping timer to interrupt.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ftq_common::metrics::global_metrics;
use ftq_common::{
    AttemptId, CancellationFlag, FtqError, PlanNodeId, QueryId, Result, RetryConfig, RetryPolicy,
    StageId, TaskId,
};
use ftq_exchange::{ExchangeHandle, ExchangeManager, ExchangeSink};
use ftq_stats::{OperatorStatsSnapshot, StatsAggregator};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::{classify, FailureCategory};

/// Task lifecycle states tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// An attempt is pending scheduling (possibly behind a backoff deadline).
    Scheduled,
    /// The current attempt is executing.
    Running,
    /// A terminal attempt completed successfully.
    Succeeded,
    /// Retry budget exhausted, non-retryable failure, or cancellation.
    Abandoned,
}

/// One terminal attempt outcome, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutcome {
    /// The attempt this outcome belongs to.
    pub attempt: AttemptId,
    /// Failure category, or `None` for a successful attempt.
    pub category: Option<FailureCategory>,
    /// Unix timestamp in milliseconds.
    pub at_ms: u64,
    /// Human-readable outcome message.
    pub message: String,
}

/// Terminal failure surfaced to the caller when a task is abandoned.
///
/// Carries the full attempt history so the user-visible error can report
/// the last failure's category and the number of attempts made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub attempts_made: u32,
    pub last_category: FailureCategory,
    pub history: Vec<AttemptOutcome>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed after {} attempts, last failure: {}",
            self.task, self.attempts_made, self.last_category
        )
    }
}

/// Outcome of one failure report.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Schedule a fresh attempt of the failing task once `ready_at_ms`
    /// passes; spooled sibling inputs are reused.
    RetryTask {
        attempt: AttemptId,
        ready_at_ms: u64,
    },
    /// Discard all progress and restart every stage from scratch.
    RestartQuery,
    /// The task is terminally failed; propagate to the caller.
    Abandon(TaskFailure),
    /// Duplicate or stale report; no action was taken.
    Ignored,
}

struct TaskRecord {
    required_inputs: Vec<StageId>,
    is_producer: bool,
    state: TaskState,
    current_attempt: u32,
    ready_at_ms: u64,
    history: Vec<AttemptOutcome>,
}

/// Owns attempt lifecycles for one query's tasks.
///
/// Transitions for a given task are serialized through that task's lock;
/// different tasks proceed fully in parallel.
pub struct RetryCoordinator {
    query: QueryId,
    config: RetryConfig,
    exchange: Arc<ExchangeManager>,
    stats: Arc<StatsAggregator>,
    tasks: Mutex<HashMap<TaskId, Arc<Mutex<TaskRecord>>>>,
    cancel: CancellationFlag,
}

impl RetryCoordinator {
    /// Creates a coordinator with a validated retry configuration.
    ///
    /// # Errors
    /// Fails for invalid configuration values.
    pub fn new(
        query: QueryId,
        config: RetryConfig,
        exchange: Arc<ExchangeManager>,
        stats: Arc<StatsAggregator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            query,
            config,
            exchange,
            stats,
            tasks: Mutex::new(HashMap::new()),
            cancel: CancellationFlag::new(),
        })
    }

    pub fn query(&self) -> QueryId {
        self.query
    }

    /// Cancellation flag shared with exchange readers and callers.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn exchange(&self) -> &Arc<ExchangeManager> {
        &self.exchange
    }

    /// Registers a task with its upstream exchange dependencies and returns
    /// its first attempt. Re-registering returns the current attempt.
    pub fn register_task(
        &self,
        task: TaskId,
        required_inputs: Vec<StageId>,
        is_producer: bool,
    ) -> AttemptId {
        let mut tasks = self.tasks.lock().expect("task registry lock");
        if let Some(existing) = tasks.get(&task) {
            let rec = existing.lock().expect("task record lock");
            return AttemptId::new(task, rec.current_attempt);
        }
        tasks.insert(
            task,
            Arc::new(Mutex::new(TaskRecord {
                required_inputs,
                is_producer,
                state: TaskState::Scheduled,
                current_attempt: 1,
                ready_at_ms: 0,
                history: Vec::new(),
            })),
        );
        drop(tasks);
        global_metrics().inc_task_attempt(&self.query.to_string(), task.stage.0);
        debug!(query = %self.query, %task, "registered task");
        AttemptId::new(task, 1)
    }

    /// Marks the current attempt running.
    ///
    /// Stale or unknown attempt references are ignored.
    ///
    /// # Errors
    /// Fails for a task that was never registered.
    pub fn attempt_started(&self, attempt: AttemptId) -> Result<()> {
        let rec = self.task_record(attempt.task)?;
        let mut rec = rec.lock().expect("task record lock");
        if rec.state == TaskState::Scheduled && rec.current_attempt == attempt.attempt {
            rec.state = TaskState::Running;
            debug!(query = %self.query, %attempt, "attempt started");
        }
        Ok(())
    }

    /// Scheduled attempts whose backoff deadline has passed.
    ///
    /// Pull-based, deterministic, and empty once the query is cancelled.
    pub fn next_runnable(&self, now_ms: u64) -> Vec<AttemptId> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let tasks: Vec<(TaskId, Arc<Mutex<TaskRecord>>)> = {
            let tasks = self.tasks.lock().expect("task registry lock");
            tasks.iter().map(|(t, r)| (*t, Arc::clone(r))).collect()
        };
        let mut runnable = Vec::new();
        for (task, rec) in tasks {
            let rec = rec.lock().expect("task record lock");
            if rec.state == TaskState::Scheduled && rec.ready_at_ms <= now_ms {
                runnable.push(AttemptId::new(task, rec.current_attempt));
            }
        }
        runnable.sort_by_key(|a| (a.task.stage.0, a.task.task, a.attempt));
        runnable
    }

    /// Handles a failure report for one attempt.
    ///
    /// Duplicate reports for the same attempt are deduplicated: only the
    /// first one acts, later ones return [`RetryDecision::Ignored`].
    pub fn on_attempt_failed(&self, attempt: AttemptId, error: &FtqError) -> RetryDecision {
        let now = now_ms();
        let Ok(rec_arc) = self.task_record(attempt.task) else {
            warn!(query = %self.query, %attempt, "failure report for unknown task ignored");
            return RetryDecision::Ignored;
        };

        let escalate;
        {
            let mut rec = rec_arc.lock().expect("task record lock");
            if matches!(rec.state, TaskState::Succeeded | TaskState::Abandoned)
                || rec.current_attempt != attempt.attempt
            {
                debug!(query = %self.query, %attempt, "duplicate or stale failure report ignored");
                return RetryDecision::Ignored;
            }

            let category = classify(error);
            rec.history.push(AttemptOutcome {
                attempt,
                category: Some(category),
                at_ms: now,
                message: error.to_string(),
            });

            if !category.is_retryable(self.config.policy)
                || attempt.attempt >= self.config.max_attempts
            {
                rec.state = TaskState::Abandoned;
                let failure = TaskFailure {
                    task: attempt.task,
                    attempts_made: attempt.attempt,
                    last_category: category,
                    history: rec.history.clone(),
                };
                warn!(
                    query = %self.query,
                    %attempt,
                    %category,
                    attempts_made = failure.attempts_made,
                    "task abandoned"
                );
                global_metrics().inc_task_abandoned(&self.query.to_string(), attempt.task.stage.0);
                return RetryDecision::Abandon(failure);
            }

            match self.config.policy {
                RetryPolicy::Task if self.inputs_resolvable(&rec.required_inputs) => {
                    rec.current_attempt = attempt.attempt + 1;
                    rec.state = TaskState::Scheduled;
                    rec.ready_at_ms = now.saturating_add(backoff_delay_ms(
                        &self.config,
                        attempt.attempt,
                    ));
                    let next = AttemptId::new(attempt.task, rec.current_attempt);
                    info!(
                        query = %self.query,
                        failed = %attempt,
                        next = %next,
                        %category,
                        ready_at_ms = rec.ready_at_ms,
                        "scheduling task retry"
                    );
                    global_metrics().inc_task_retry(&self.query.to_string(), attempt.task.stage.0);
                    global_metrics()
                        .inc_task_attempt(&self.query.to_string(), attempt.task.stage.0);
                    return RetryDecision::RetryTask {
                        attempt: next,
                        ready_at_ms: rec.ready_at_ms,
                    };
                }
                RetryPolicy::Task => {
                    info!(
                        query = %self.query,
                        %attempt,
                        "required inputs no longer resolvable, escalating to query restart"
                    );
                    escalate = now.saturating_add(backoff_delay_ms(&self.config, attempt.attempt));
                }
                RetryPolicy::Query => {
                    escalate = now.saturating_add(backoff_delay_ms(&self.config, attempt.attempt));
                }
                RetryPolicy::None => unreachable!("non-retryable policy is handled above"),
            }
        }

        self.restart_query(attempt.task, escalate);
        RetryDecision::RestartQuery
    }

    /// Handles a success report for one attempt.
    ///
    /// Seals the attempt's sink when the task is a producer and merges the
    /// attempt's final statistics. Stale success reports (an older attempt
    /// finishing after a retry was already scheduled) are dropped along
    /// with their sink, so only one attempt per task ever contributes
    /// output and statistics.
    ///
    /// # Errors
    /// Fails when sealing the producer sink fails; the attempt stays
    /// running and the caller should report the seal error as a failure.
    pub fn on_attempt_succeeded(
        &self,
        attempt: AttemptId,
        sink: Option<ExchangeSink>,
        snapshots: &[(PlanNodeId, OperatorStatsSnapshot)],
    ) -> Result<Option<ExchangeHandle>> {
        let now = now_ms();
        let rec_arc = self.task_record(attempt.task)?;
        let mut rec = rec_arc.lock().expect("task record lock");
        if matches!(rec.state, TaskState::Succeeded | TaskState::Abandoned)
            || rec.current_attempt != attempt.attempt
        {
            debug!(query = %self.query, %attempt, "stale success report dropped");
            return Ok(None);
        }

        let handle = match sink {
            Some(sink) => {
                debug_assert!(rec.is_producer, "sink supplied for a non-producer task");
                Some(self.exchange.seal_sink(sink)?)
            }
            None => None,
        };

        rec.state = TaskState::Succeeded;
        rec.history.push(AttemptOutcome {
            attempt,
            category: None,
            at_ms: now,
            message: "succeeded".to_string(),
        });
        drop(rec);

        for (node, snapshot) in snapshots {
            self.stats.merge(*node, snapshot);
        }
        info!(query = %self.query, %attempt, "attempt succeeded");
        Ok(handle)
    }

    /// Cancels the query: aborts backoff scheduling, flips the shared
    /// cancellation flag for in-flight reads, and abandons every
    /// non-terminal task.
    pub fn cancel_query(&self) {
        self.cancel.cancel();
        let now = now_ms();
        let tasks: Vec<(TaskId, Arc<Mutex<TaskRecord>>)> = {
            let tasks = self.tasks.lock().expect("task registry lock");
            tasks.iter().map(|(t, r)| (*t, Arc::clone(r))).collect()
        };
        for (task, rec) in tasks {
            let mut rec = rec.lock().expect("task record lock");
            if matches!(rec.state, TaskState::Succeeded | TaskState::Abandoned) {
                continue;
            }
            let attempt = AttemptId::new(task, rec.current_attempt);
            rec.state = TaskState::Abandoned;
            rec.history.push(AttemptOutcome {
                attempt,
                category: Some(FailureCategory::Fatal),
                at_ms: now,
                message: "cancelled".to_string(),
            });
        }
        info!(query = %self.query, "query cancelled");
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks
            .get(&task)
            .map(|rec| rec.lock().expect("task record lock").state)
    }

    /// Full attempt history for diagnostics.
    pub fn attempt_history(&self, task: TaskId) -> Vec<AttemptOutcome> {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks
            .get(&task)
            .map(|rec| rec.lock().expect("task record lock").history.clone())
            .unwrap_or_default()
    }

    fn inputs_resolvable(&self, required_inputs: &[StageId]) -> bool {
        required_inputs
            .iter()
            .all(|stage| self.exchange.resolve(self.query, *stage).is_some())
    }

    // Whole-query restart: reschedule every non-abandoned task with a fresh
    // attempt number, then discard all spooled output. The failing task's
    // budget was already checked; other tasks get their attempt number
    // bumped without a budget check since their increments are not
    // failure-driven.
    //
    // Records are bumped before the exchange is invalidated: a success
    // report for a pre-restart attempt seals while holding its record lock,
    // so it either lands before the bump (and its output is wiped below) or
    // fails its currency check and never seals at all. Invalidating first
    // would let such a report re-seal discarded output.
    fn restart_query(&self, failing_task: TaskId, failing_ready_at_ms: u64) {
        let tasks: Vec<(TaskId, Arc<Mutex<TaskRecord>>)> = {
            let tasks = self.tasks.lock().expect("task registry lock");
            tasks.iter().map(|(t, r)| (*t, Arc::clone(r))).collect()
        };
        for (task, rec) in tasks {
            let mut rec = rec.lock().expect("task record lock");
            if rec.state == TaskState::Abandoned {
                continue;
            }
            rec.current_attempt += 1;
            rec.state = TaskState::Scheduled;
            rec.ready_at_ms = if task == failing_task {
                failing_ready_at_ms
            } else {
                0
            };
            global_metrics().inc_task_attempt(&self.query.to_string(), task.stage.0);
        }

        self.exchange.invalidate_query(self.query);
        global_metrics().inc_query_restart(&self.query.to_string());
        info!(query = %self.query, "query marked for restart, all sinks reopen from scratch");
    }

    fn task_record(&self, task: TaskId) -> Result<Arc<Mutex<TaskRecord>>> {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks.get(&task).map(Arc::clone).ok_or_else(|| {
            FtqError::Execution(format!("task {task} is not registered with the coordinator"))
        })
    }
}

/// Exponential backoff before attempt `failed_attempt + 1`, bounded by the
/// configured cap. Per task; never shared across tasks.
pub fn backoff_delay_ms(config: &RetryConfig, failed_attempt: u32) -> u64 {
    let exponent = failed_attempt.saturating_sub(1).min(16);
    config
        .initial_delay_ms
        .saturating_mul(1_u64 << exponent)
        .min(config.max_delay_ms)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
