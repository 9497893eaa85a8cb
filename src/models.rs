//! Domain model shared by the queue, registry, broker, monitor, and
//! orchestrator (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::clock::Clock;
use crate::id;

/// Task priority. Ordered so that `Critical > High > Normal > Low`,
/// matching the four dispatch lanes the queue scans highest-first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl TaskStatus {
    /// Whether `self -> next` is a legal transition (spec.md §4 Task
    /// lifecycle: PENDING -> ASSIGNED -> IN_PROGRESS -> terminal, with
    /// PENDING/ASSIGNED able to short-circuit to CANCELLED).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Cancelled)
                | (Assigned, Pending) // assignment fell through, requeued
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Timeout)
                | (InProgress, Cancelled)
                | (Failed, Pending) // retry requeues a failed task
                | (Timeout, Pending) // retry applies the same policy to a timed-out task
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }
}

/// Outcome an agent reports back for a completed or failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskExecutionResult {
    Success { output: serde_json::Value },
    Failure { error: String },
}

/// Unit of work flowing through the queue (spec.md §3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub required_capabilities: HashSet<String>,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<TaskExecutionResult>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub dependencies: Vec<String>,
    pub metadata: HashMap<String, String>,
    /// Set on a retry requeue; the queue withholds the task from
    /// dispatch until this instant (spec.md §4 backoff gating).
    pub not_before: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    pub fn new(
        clock: &dyn Clock,
        task_type: impl Into<String>,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        let now = clock.now_utc();
        Self {
            id: id::generate("task", clock.now_millis()),
            task_type: task_type.into(),
            priority,
            payload,
            required_capabilities: HashSet::new(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            timeout_ms: crate::constants::DEFAULT_TASK_TIMEOUT_MS,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            not_before: None,
        }
    }

    pub fn with_required_capabilities(mut self, caps: HashSet<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn has_capabilities(&self, agent_capabilities: &HashSet<String>) -> bool {
        self.required_capabilities.is_subset(agent_capabilities)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Result record persisted for a finished task (spec.md §4 `TaskStore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub result: Option<TaskExecutionResult>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Inter-agent message routed through the broker (spec.md §4 Message
/// Broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// `None` for a broadcast.
    pub to: Option<String>,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(
        clock: &dyn Clock,
        from: impl Into<String>,
        to: Option<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id::generate("msg", clock.now_millis()),
            from: from.into(),
            to,
            message_type: message_type.into(),
            payload,
            priority: Priority::Normal,
            timestamp: clock.now_utc(),
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Declared capabilities and limits an agent registers with (spec.md §4
/// `AgentConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub capabilities: HashSet<String>,
    pub max_concurrent_tasks: usize,
    pub default_timeout_ms: u64,
    pub retry_attempts: u32,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            max_concurrent_tasks: 1,
            default_timeout_ms: crate::constants::DEFAULT_TASK_TIMEOUT_MS,
            retry_attempts: crate::constants::DEFAULT_MAX_RETRIES,
            tags: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: HashSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}

/// Coarse lifecycle status of a registered agent (replaces the
/// teacher's boolean `is_busy` flag with the fuller state set the
/// registry and monitor both need).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    Offline,
    Starting,
    Idle,
    Busy,
    Stopping,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Rolling performance counters the registry exposes per agent (spec.md
/// §4 `AgentMetrics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_in_progress: u64,
    pub tasks_failed: u64,
    pub average_task_duration_ms: f64,
    pub last_active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub uptime_ms: i64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_in_progress: 0,
            tasks_failed: 0,
            average_task_duration_ms: 0.0,
            last_active_at: None,
            uptime_ms: 0,
        }
    }
}

impl AgentMetrics {
    /// Folds a finished task's duration into the running mean, the way
    /// the teacher's `AgentStatus::complete_task` does.
    pub fn record_completion(&mut self, duration_ms: i64, now: chrono::DateTime<chrono::Utc>) {
        let completed_before = self.tasks_completed;
        let total_before = self.average_task_duration_ms * completed_before as f64;
        self.tasks_completed += 1;
        self.average_task_duration_ms =
            (total_before + duration_ms as f64) / self.tasks_completed as f64;
        self.last_active_at = Some(now);
    }

    pub fn record_failure(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.tasks_failed += 1;
        self.last_active_at = Some(now);
    }
}

/// Full record the registry holds for a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub id: String,
    pub config: AgentConfig,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
}

/// One observation fed into the monitor's per-agent ring buffer
/// (spec.md §4 Monitor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub agent_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub task_duration_ms: i64,
    pub success: bool,
}

/// Metric an [`AlertRule`] watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AlertMetric {
    FailureRate,
    AverageResponseTimeMs,
    AgentOffline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub severity: crate::events::AlertSeverity,
    pub cooldown_ms: i64,
    /// Minimum sample count the window must have before this rule can
    /// fire (the built-in `high-failure-rate` rule needs more than 10
    /// samples before a high failure rate is meaningful).
    pub min_samples: usize,
    pub enabled: bool,
}
