//! System-wide default values. Callers override these through
//! [`crate::config::OrchestratorConfig`]; the constants here are the
//! fallbacks used when a config field is left at its default.

/// Dispatch loop cadence (spec.md default `dispatchIntervalMs`).
pub const DISPATCH_INTERVAL_MS: u64 = 5_000;

/// Default task queue capacity (`taskQueueSize`).
pub const MAX_QUEUE_SIZE: usize = 1_000;

/// Default scaling ceiling signalled to the host (`maxAgents`).
pub const MAX_AGENTS: usize = 50;

/// Heartbeat cadence agents are expected to honour (`heartbeatIntervalMs`).
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// How stale a heartbeat can get before the registry emits `agent.stale`.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 120_000;

/// Cadence of the registry's staleness sweep.
pub const STALENESS_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Default per-task timeout (`taskTimeoutMs`).
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

/// Default retry policy (`retryPolicy`).
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Grace period an agent gets to honour a cancellation signal before the
/// orchestrator marks the task CANCELLED regardless.
pub const CANCEL_GRACE_MS: u64 = 5_000;

/// Default graceful-shutdown drain deadline (`drainDeadlineMs`).
pub const DEFAULT_DRAIN_DEADLINE_MS: u64 = 10_000;

/// Error burst threshold that trips the orchestrator into a degraded,
/// submission-refusing state.
pub const ERROR_BURST_THRESHOLD: usize = 10;
pub const ERROR_BURST_WINDOW_MS: u64 = 60_000;

/// Monitor ring-buffer size per agent (`maxHistorySize`).
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 1_000;

/// System-metrics collection cadence.
pub const SYSTEM_METRICS_INTERVAL_MS: u64 = 30_000;

/// Monitor health-check sweep cadence.
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;

/// A monitored agent is considered unhealthy once its latest sample is
/// older than this.
pub const AGENT_HEALTHY_WINDOW_MS: i64 = 120_000;

/// Default alert cooldowns, per (rule, agent).
pub const ALERT_COOLDOWN_HIGH_FAILURE_MS: i64 = 5 * 60_000;
pub const ALERT_COOLDOWN_SLOW_RESPONSE_MS: i64 = 5 * 60_000;
pub const ALERT_COOLDOWN_AGENT_OFFLINE_MS: i64 = 60_000;

/// Default thresholds for the Monitor's built-in alert rules.
pub const ALERT_THRESHOLD_HIGH_FAILURE_RATE: f64 = 0.5;
pub const ALERT_THRESHOLD_SLOW_RESPONSE_MS: f64 = 10_000.0;
pub const ALERT_MIN_SAMPLES_HIGH_FAILURE_RATE: usize = 10;

/// Message broker defaults.
pub const DEFAULT_INBOX_SIZE: usize = 1_000;
pub const DEFAULT_HISTORY_SIZE: usize = 10_000;
pub const DEFAULT_HISTORY_TTL_MS: i64 = 60 * 60_000;
pub const HISTORY_SWEEP_INTERVAL_MS: u64 = 5 * 60_000;
