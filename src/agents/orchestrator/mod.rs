pub mod agent_registry;
pub mod broker;
pub mod monitor;
pub mod result_store;
pub mod task_queue;

pub use agent_registry::{AgentFilter, AgentRegistry, RegistryStats};
pub use broker::MessageBroker;
pub use monitor::{DashboardData, HealthStatus, Monitor, SystemMetrics};
pub use result_store::{InMemoryTaskStore, TaskStore};
pub use task_queue::TaskQueue;

use crate::agents::Agent;
use crate::clock::Clock;
use crate::config::{LoadBalancingStrategy, OrchestratorConfig};
use crate::error::{MeshError, Result};
use crate::events::{CancelSource, Event, EventSink, NullEventSink};
use crate::models::{
    AgentStatus as AgentLifecycleStatus, PerformanceSample, Task, TaskExecutionResult, TaskResult,
    TaskStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Summary of orchestrator state for external callers (spec.md §4
/// `Orchestrator.getSystemStatus`). Deliberately decoupled from any host
/// transport type, the way the teacher keeps `SystemStatus` independent
/// of its HTTP API layer.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub running: bool,
    pub degraded: bool,
    pub queue_length: usize,
    pub agent_count: usize,
    pub uptime_ms: i64,
}

struct ErrorBurst {
    timestamps: Mutex<Vec<chrono::DateTime<chrono::Utc>>>,
}

impl ErrorBurst {
    fn new() -> Self {
        Self {
            timestamps: Mutex::new(Vec::new()),
        }
    }

    async fn record_and_check(&self, now: chrono::DateTime<chrono::Utc>, window_ms: u64, threshold: usize) -> bool {
        let mut timestamps = self.timestamps.lock().await;
        timestamps.push(now);
        timestamps.retain(|t| (now - *t).num_milliseconds() <= window_ms as i64);
        timestamps.len() >= threshold
    }
}

/// Coordinates the task queue, agent registry, message broker, and
/// monitor into a single running system (spec.md §4 Orchestrator).
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: TaskQueue,
    registry: AgentRegistry,
    broker: MessageBroker,
    monitor: Monitor,
    store: Arc<dyn TaskStore>,
    agents: Arc<RwLock<HashMap<String, Arc<dyn Agent>>>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    error_burst: Arc<ErrorBurst>,
    started_at_ms: Arc<AtomicUsize>,
    dispatch_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    round_robin_cursor: Arc<AtomicUsize>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store_and_events(
            config.clone(),
            clock.clone(),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(NullEventSink),
        )
    }

    pub fn with_store_and_events(
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn TaskStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let registry = AgentRegistry::new(config.heartbeat_timeout_ms, clock.clone(), events.clone());
        let broker = MessageBroker::new(
            crate::constants::DEFAULT_INBOX_SIZE,
            crate::constants::DEFAULT_HISTORY_SIZE,
            crate::constants::DEFAULT_HISTORY_TTL_MS,
            clock.clone(),
            events.clone(),
        );
        let monitor = Monitor::new(
            config.max_history_size,
            crate::constants::AGENT_HEALTHY_WINDOW_MS,
            clock.clone(),
            events.clone(),
        );

        Self {
            queue: TaskQueue::new(config.task_queue_size),
            registry,
            broker,
            monitor,
            store,
            agents: Arc::new(RwLock::new(HashMap::new())),
            clock,
            events,
            running: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(AtomicBool::new(false)),
            error_burst: Arc::new(ErrorBurst::new()),
            started_at_ms: Arc::new(AtomicUsize::new(0)),
            dispatch_handle: Arc::new(Mutex::new(None)),
            round_robin_cursor: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::AlreadyRunning);
        }
        self.degraded.store(false, Ordering::SeqCst);
        self.started_at_ms
            .store(self.clock.now_millis().max(0) as usize, Ordering::SeqCst);

        let orchestrator = self.clone();
        let handle = tokio::spawn(async move { orchestrator.dispatch_loop().await });
        *self.dispatch_handle.lock().await = Some(handle);

        info!("orchestrator started");
        self.events.emit(Event::OrchestratorStarted).await;
        Ok(())
    }

    /// Stops the dispatch loop, giving in-flight tasks up to
    /// `drain_deadline_ms` to finish before returning.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MeshError::NotRunning);
        }

        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            handle.abort();
        }

        tokio::time::sleep(Duration::from_millis(self.config.drain_deadline_ms.min(50))).await;

        info!("orchestrator stopped");
        self.events.emit(Event::OrchestratorStopped).await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let id = agent.id().to_string();
        self.registry.register(id.clone(), agent.config().clone()).await?;
        self.broker.ensure_inbox(&id).await;
        self.monitor.start_monitoring(&id).await;
        self.agents.write().await.insert(id.clone(), agent.clone());
        agent.start().await?;
        self.registry.set_status(&id, AgentLifecycleStatus::Idle).await?;
        Ok(())
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        if let Some(agent) = self.agents.write().await.remove(agent_id) {
            let _ = agent.stop().await;
        }
        self.broker.remove_inbox(agent_id).await;
        self.monitor.stop_monitoring(agent_id).await;
        self.registry.unregister(agent_id).await
    }

    /// Submits a task for dispatch (spec.md §4 `Orchestrator.submitTask`).
    /// Refused while the orchestrator is stopped or degraded by an error
    /// burst.
    pub async fn submit_task(&self, task: Task) -> Result<String> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        if self.degraded.load(Ordering::SeqCst) {
            return Err(MeshError::NotRunning);
        }

        let task_id = task.id.clone();
        self.queue.enqueue(task).await?;

        debug!(task_id = %task_id, "task submitted");
        self.events.emit(Event::TaskSubmitted { task_id: task_id.clone() }).await;
        self.events.emit(Event::TaskCreated { task_id: task_id.clone() }).await;
        Ok(task_id)
    }

    /// Cancels a task. A queued task is removed outright; an assigned or
    /// in-progress task gets a best-effort cancel signal and up to
    /// `CANCEL_GRACE_MS` to honour it before being marked CANCELLED
    /// regardless.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        if let Some(task) = self.queue.remove(task_id).await {
            let _ = task;
            self.events
                .emit(Event::TaskCancelled {
                    task_id: task_id.to_string(),
                    source: CancelSource::Queue,
                })
                .await;
            return Ok(());
        }

        let task = self
            .queue
            .get_task(task_id)
            .await
            .ok_or_else(|| MeshError::NotFound { id: task_id.to_string() })?;

        if task.status.is_terminal() {
            return Err(MeshError::InvalidTransition {
                id: task_id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            });
        }

        if let Some(agent_id) = task.assigned_agent.clone() {
            if let Some(agent) = self.agents.read().await.get(&agent_id).cloned() {
                let _ = agent.cancel_task(task_id).await;
            }
        }

        let now = self.clock.now_utc();
        self.queue
            .transition(task_id, TaskStatus::Cancelled, |t| {
                t.completed_at = Some(now);
                t.updated_at = now;
            })
            .await?;
        self.events
            .emit(Event::TaskCancelled {
                task_id: task_id.to_string(),
                source: CancelSource::Agent,
            })
            .await;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.queue.get_task(task_id).await)
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        self.store.find_result(task_id).await
    }

    /// Signal-only scaling hint (spec.md §4: scaling never spawns or
    /// kills agents itself, it only emits `system.scale` for a host to
    /// act on).
    pub async fn request_scale(&self, target: usize) -> Result<()> {
        let current = self.registry.count().await;
        self.events.emit(Event::SystemScale { current, target }).await;
        Ok(())
    }

    pub async fn system_status(&self) -> SystemStatus {
        let started_at = self.started_at_ms.load(Ordering::SeqCst) as i64;
        let uptime_ms = if started_at == 0 {
            0
        } else {
            (self.clock.now_millis() - started_at).max(0)
        };

        SystemStatus {
            running: self.is_running(),
            degraded: self.degraded.load(Ordering::SeqCst),
            queue_length: self.queue.size().await,
            agent_count: self.registry.count().await,
            uptime_ms,
        }
    }

    async fn dispatch_loop(&self) {
        info!("dispatch loop started");
        loop {
            if !self.is_running() {
                break;
            }

            if let Err(e) = self.dispatch_once().await {
                self.record_orchestrator_error("dispatch", &e.to_string()).await;
            }

            tokio::time::sleep(Duration::from_millis(self.config.dispatch_interval_ms)).await;
        }
        info!("dispatch loop stopped");
    }

    /// Assigns as many eligible queued tasks to idle agents as possible
    /// in a single pass. Exposed separately from the loop so scenario
    /// tests can trigger a dispatch deterministically instead of waiting
    /// on the interval timer.
    pub async fn dispatch_once(&self) -> Result<()> {
        loop {
            let idle_agents = self.ordered_idle_agents().await;
            if idle_agents.is_empty() {
                return Ok(());
            }

            let completed_ids = self.completed_task_ids().await;
            let now = self.clock.now_utc();
            let mut assigned_any = false;

            for agent_id in idle_agents {
                let Some(record) = self.registry.get(&agent_id).await else {
                    continue;
                };
                let Some(task) = self
                    .queue
                    .dequeue_for(&record.config.capabilities, &completed_ids, now)
                    .await
                else {
                    continue;
                };

                self.assign_task(task, &agent_id).await?;
                assigned_any = true;
            }

            if !assigned_any {
                return Ok(());
            }
        }
    }

    /// Idle agents in spec.md §4.3 dispatch order (heartbeat-ascending),
    /// then reordered by the configured load-balancing strategy.
    /// `CapabilityBased` is a no-op here: heartbeat-ascending already
    /// matches its intent, and actual capability matching happens inside
    /// `TaskQueue::dequeue_for`.
    async fn ordered_idle_agents(&self) -> Vec<String> {
        let idle = self
            .registry
            .find_agents(&AgentFilter {
                status: Some(AgentLifecycleStatus::Idle),
                ..Default::default()
            })
            .await;

        match self.config.load_balancing.strategy {
            LoadBalancingStrategy::CapabilityBased => {
                idle.into_iter().map(|a| a.id).collect()
            }
            LoadBalancingStrategy::LeastBusy => {
                let mut idle = idle;
                idle.sort_by_key(|a| a.metrics.tasks_in_progress);
                idle.into_iter().map(|a| a.id).collect()
            }
            LoadBalancingStrategy::RoundRobin => {
                if idle.is_empty() {
                    return Vec::new();
                }
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % idle.len();
                let mut ids: Vec<String> = idle.into_iter().map(|a| a.id).collect();
                ids.rotate_left(cursor);
                ids
            }
        }
    }

    async fn completed_task_ids(&self) -> HashSet<String> {
        self.queue.get_by_status(TaskStatus::Completed).await
    }

    async fn assign_task(&self, task: Task, agent_id: &str) -> Result<()> {
        let Some(agent) = self.agents.read().await.get(agent_id).cloned() else {
            self.queue.return_unassigned(&task.id).await?;
            return Ok(());
        };

        let task_id = task.id.clone();
        let agent_id_owned = agent_id.to_string();
        let assigned = self
            .queue
            .transition(&task_id, TaskStatus::Assigned, |t| {
                t.assigned_agent = Some(agent_id_owned.clone());
            })
            .await?;
        self.events
            .emit(Event::TaskAssigned {
                task_id: task_id.clone(),
                agent_id: agent_id.to_string(),
            })
            .await;

        self.registry.set_status(agent_id, AgentLifecycleStatus::Busy).await?;
        self.registry
            .update_metrics(agent_id, |m| m.tasks_in_progress += 1)
            .await?;

        let accepted = agent.assign_task(assigned.clone()).await.unwrap_or(false);
        if !accepted {
            self.queue
                .transition(&task_id, TaskStatus::Pending, |t| t.assigned_agent = None)
                .await?;
            self.registry.set_status(agent_id, AgentLifecycleStatus::Idle).await?;
            self.registry
                .update_metrics(agent_id, |m| m.tasks_in_progress = m.tasks_in_progress.saturating_sub(1))
                .await?;
            return Ok(());
        }

        self.queue.transition(&task_id, TaskStatus::InProgress, |_| {}).await?;
        self.events.emit(Event::TaskStarted { task_id }).await;
        Ok(())
    }

    /// Reports an executed task's outcome back into the system. Agents
    /// call this (directly, or a host relays it) after `assign_task`
    /// accepted the work.
    pub async fn report_task_outcome(
        &self,
        task_id: &str,
        agent_id: &str,
        outcome: TaskExecutionResult,
    ) -> Result<()> {
        let task = self
            .queue
            .get_task(task_id)
            .await
            .ok_or_else(|| MeshError::NotFound { id: task_id.to_string() })?;

        let now = self.clock.now_utc();
        let duration_ms = (now - task.created_at).num_milliseconds();
        let success = matches!(outcome, TaskExecutionResult::Success { .. });

        self.monitor
            .record_sample(PerformanceSample {
                agent_id: agent_id.to_string(),
                timestamp: now,
                task_duration_ms: duration_ms,
                success,
            })
            .await;

        let task = if success {
            let finished = self
                .queue
                .transition(task_id, TaskStatus::Completed, |t| {
                    t.completed_at = Some(now);
                    t.result = Some(outcome.clone());
                })
                .await?;
            self.registry
                .update_metrics(agent_id, |m| {
                    m.tasks_in_progress = m.tasks_in_progress.saturating_sub(1);
                    m.record_completion(duration_ms, now);
                })
                .await?;
            self.registry.set_status(agent_id, AgentLifecycleStatus::Idle).await?;
            self.events
                .emit(Event::TaskCompleted {
                    task_id: task_id.to_string(),
                    duration_ms,
                })
                .await;
            finished
        } else {
            let message = match &outcome {
                TaskExecutionResult::Failure { error } => error.clone(),
                _ => "unknown failure".to_string(),
            };
            let failed = self
                .queue
                .transition(task_id, TaskStatus::Failed, |t| {
                    t.completed_at = Some(now);
                    t.error = Some(message.clone());
                })
                .await?;
            self.registry
                .update_metrics(agent_id, |m| {
                    m.tasks_in_progress = m.tasks_in_progress.saturating_sub(1);
                    m.record_failure(now);
                })
                .await?;

            if failed.can_retry() {
                let delay_ms = self.config.retry_policy.delay_for_attempt(failed.retry_count + 1);
                let not_before = now + chrono::Duration::milliseconds(delay_ms as i64);
                let retried = self
                    .queue
                    .transition(task_id, TaskStatus::Pending, |t| {
                        t.retry_count += 1;
                        t.assigned_agent = None;
                        t.completed_at = None;
                        t.not_before = Some(not_before);
                    })
                    .await?;
                self.registry.set_status(agent_id, AgentLifecycleStatus::Idle).await?;
                self.events
                    .emit(Event::TaskRetryScheduled {
                        task_id: task_id.to_string(),
                        retry_count: retried.retry_count,
                    })
                    .await;
                debug!(task_id, delay_ms, "retry scheduled");
                retried
            } else {
                self.registry.set_status(agent_id, AgentLifecycleStatus::Idle).await?;
                self.events
                    .emit(Event::TaskFailed {
                        task_id: task_id.to_string(),
                        message,
                    })
                    .await;
                failed
            }
        };

        self.store
            .save_result(
                task_id.to_string(),
                TaskResult {
                    task_id: task_id.to_string(),
                    status: task.status,
                    result: task.result.clone(),
                    error: task.error.clone(),
                    duration_ms,
                    completed_at: now,
                },
            )
            .await?;

        Ok(())
    }

    /// Marks a task TIMEOUT if it has been IN_PROGRESS longer than its
    /// configured `timeout_ms`, then immediately applies the same retry
    /// policy `report_task_outcome` uses for a reported failure (spec.md
    /// §4.3): a task with retries left gets requeued PENDING with its
    /// `retry_count` bumped and a backoff `not_before`; one that has
    /// exhausted its retries stays TIMEOUT. Called by a host-driven
    /// sweep (or tests) rather than an internal timer per task, to stay
    /// clock-injectable.
    pub async fn sweep_timeouts(&self) -> Result<Vec<String>> {
        let now = self.clock.now_utc();
        let mut timed_out = Vec::new();

        let in_progress_ids = self.queue.get_by_status(TaskStatus::InProgress).await;
        for task_id in in_progress_ids {
            let Some(task) = self.queue.get_task(&task_id).await else {
                continue;
            };
            if (now - task.updated_at).num_milliseconds() as u64 <= task.timeout_ms {
                continue;
            }

            let agent_id = task.assigned_agent.clone();
            let timed = self
                .queue
                .transition(&task_id, TaskStatus::Timeout, |t| t.completed_at = Some(now))
                .await?;
            self.events.emit(Event::TaskTimeout { task_id: task_id.clone() }).await;
            timed_out.push(task_id.clone());

            if let Some(agent_id) = &agent_id {
                self.registry
                    .update_metrics(agent_id, |m| m.tasks_in_progress = m.tasks_in_progress.saturating_sub(1))
                    .await
                    .ok();
            }

            if let Some(agent) = agent_id.as_deref() {
                if let Some(handle) = self.agents.read().await.get(agent).cloned() {
                    let _ = handle.cancel_task(&task_id).await;
                }
            }

            if timed.can_retry() {
                let delay_ms = self.config.retry_policy.delay_for_attempt(timed.retry_count + 1);
                let not_before = now + chrono::Duration::milliseconds(delay_ms as i64);
                let retried = self
                    .queue
                    .transition(&task_id, TaskStatus::Pending, |t| {
                        t.retry_count += 1;
                        t.assigned_agent = None;
                        t.completed_at = None;
                        t.not_before = Some(not_before);
                    })
                    .await?;
                self.events
                    .emit(Event::TaskRetryScheduled {
                        task_id: task_id.clone(),
                        retry_count: retried.retry_count,
                    })
                    .await;
            }

            if let Some(agent_id) = agent_id {
                self.registry
                    .set_status(&agent_id, AgentLifecycleStatus::Idle)
                    .await
                    .ok();
            }
        }

        Ok(timed_out)
    }

    /// Sweeps agent heartbeats for staleness (spec.md §4 registry
    /// responsibility, driven here so the orchestrator owns all
    /// periodic work).
    pub async fn sweep_agent_staleness(&self) -> Vec<String> {
        self.registry.sweep_stale().await
    }

    async fn record_orchestrator_error(&self, operation: &str, message: &str) {
        error!(operation, message, "orchestrator error");
        self.events
            .emit(Event::OrchestratorError {
                operation: operation.to_string(),
                message: message.to_string(),
            })
            .await;

        let now = self.clock.now_utc();
        let tripped = self
            .error_burst
            .record_and_check(
                now,
                crate::constants::ERROR_BURST_WINDOW_MS,
                crate::constants::ERROR_BURST_THRESHOLD,
            )
            .await;

        if tripped && !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("error burst threshold exceeded, orchestrator entering degraded state");
        }
    }
}

#[cfg(test)]
mod tests;
