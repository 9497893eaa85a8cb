//! Priority, capability, and dependency-aware task queue (spec.md §4
//! Task Queue). Owns the full task record set: a master map keyed by
//! id, a status index for `getByStatus`/`cleanup`, and four FIFO lanes
//! (one per [`Priority`]) holding only the ids currently eligible for
//! dispatch, scanned highest-priority-first.

use crate::error::{MeshError, Result};
use crate::models::{Priority, Task, TaskStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Default)]
struct Lanes {
    critical: VecDeque<String>,
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    fn remove(&mut self, priority: Priority, id: &str) -> bool {
        let lane = self.lane_mut(priority);
        if let Some(pos) = lane.iter().position(|x| x == id) {
            lane.remove(pos);
            true
        } else {
            false
        }
    }
}

struct State {
    tasks: HashMap<String, Task>,
    by_status: HashMap<TaskStatus, HashSet<String>>,
    lanes: Lanes,
}

impl State {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            by_status: HashMap::new(),
            lanes: Lanes::default(),
        }
    }

    fn move_status(&mut self, id: &str, from: TaskStatus, to: TaskStatus) {
        if let Some(set) = self.by_status.get_mut(&from) {
            set.remove(id);
        }
        self.by_status.entry(to).or_default().insert(id.to_string());
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    state: Arc<Mutex<State>>,
    max_queue_size: usize,
}

impl TaskQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            max_queue_size,
        }
    }

    /// Stores a brand-new task and places it in its priority lane.
    /// Fails with `Duplicate` if the id is already known, `QueueFull` if
    /// the pending lanes are already at capacity.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(MeshError::Duplicate { id: task.id.clone() });
        }
        if state.lanes.len() >= self.max_queue_size {
            return Err(MeshError::QueueFull {
                max: self.max_queue_size,
            });
        }

        let id = task.id.clone();
        let priority = task.priority;
        state.lanes.lane_mut(priority).push_back(id.clone());
        state.by_status.entry(task.status).or_default().insert(id.clone());
        info!(task_id = %id, priority = ?priority, "task enqueued");
        state.tasks.insert(id, task);
        Ok(())
    }

    /// Removes and returns the first eligible task for an agent with the
    /// given capabilities: all required capabilities held, all
    /// dependencies in `completed_task_ids`, and (if set) `not_before`
    /// already elapsed. Scans lanes highest-priority-first and, within a
    /// lane, FIFO.
    pub async fn dequeue_for(
        &self,
        agent_capabilities: &HashSet<String>,
        completed_task_ids: &HashSet<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<Task> {
        let mut state = self.state.lock().await;

        let found = {
            let lanes = [
                (&state.lanes.critical, Priority::Critical),
                (&state.lanes.high, Priority::High),
                (&state.lanes.normal, Priority::Normal),
                (&state.lanes.low, Priority::Low),
            ];
            lanes.into_iter().find_map(|(lane, priority)| {
                lane.iter()
                    .find(|id| {
                        state.tasks.get(id.as_str()).map_or(false, |task| {
                            task.has_capabilities(agent_capabilities)
                                && task
                                    .dependencies
                                    .iter()
                                    .all(|dep| completed_task_ids.contains(dep))
                                && task.not_before.map_or(true, |nb| now >= nb)
                        })
                    })
                    .map(|id| (priority, id.clone()))
            })
        };

        let (priority, id) = found?;
        state.lanes.remove(priority, &id);
        let task = state.tasks.get(&id).cloned();
        debug!(task_id = %id, "task dequeued");
        task
    }

    /// Re-inserts a task into its priority lane without touching its
    /// status or index placement. Used when a task was dequeued but
    /// never actually assigned (e.g. the selected agent vanished).
    pub async fn return_unassigned(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(id)
            .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;
        if task.status != TaskStatus::Pending {
            return Err(MeshError::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        let priority = task.priority;
        state.lanes.lane_mut(priority).push_back(id.to_string());
        Ok(())
    }

    /// Applies `f` to a task after validating `current -> new_status` is
    /// a legal transition (fails with `InvalidTransition` otherwise),
    /// keeping the status index and priority lane membership in sync.
    pub async fn transition(
        &self,
        id: &str,
        new_status: TaskStatus,
        f: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let mut state = self.state.lock().await;
        let before_status = state
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;

        if !before_status.can_transition_to(new_status) {
            return Err(MeshError::InvalidTransition {
                id: id.to_string(),
                from: before_status.to_string(),
                to: new_status.to_string(),
            });
        }

        let priority = state.tasks.get(id).expect("checked above").priority;
        if before_status == TaskStatus::Pending && new_status != TaskStatus::Pending {
            state.lanes.remove(priority, id);
        }

        {
            let task = state.tasks.get_mut(id).expect("checked above");
            task.status = new_status;
            f(task);
        }

        state.move_status(id, before_status, new_status);

        if new_status == TaskStatus::Pending {
            state.lanes.lane_mut(priority).push_back(id.to_string());
        }

        Ok(state.tasks.get(id).expect("checked above").clone())
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    pub async fn get_by_status(&self, status: TaskStatus) -> HashSet<String> {
        self.state
            .lock()
            .await
            .by_status
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes a specific pending task from the queue outright (spec.md
    /// §4 cancel-in-queue). Returns it if it was found.
    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?.clone();
        state.lanes.remove(task.priority, task_id);
        if let Some(set) = state.by_status.get_mut(&task.status) {
            set.remove(task_id);
        }
        state.tasks.remove(task_id);
        Some(task)
    }

    /// Purges terminal (completed/failed/cancelled/timed-out) tasks
    /// whose `updated_at` is older than `older_than_ms`. Returns how
    /// many were removed.
    pub async fn cleanup(&self, older_than_ms: i64, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && (now - t.updated_at).num_milliseconds() > older_than_ms)
            .map(|t| t.id.clone())
            .collect();

        for id in &stale {
            if let Some(task) = state.tasks.remove(id) {
                if let Some(set) = state.by_status.get_mut(&task.status) {
                    set.remove(id);
                }
            }
        }

        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up terminal tasks");
        }
        stale.len()
    }

    pub async fn peek(&self) -> Option<Task> {
        let state = self.state.lock().await;
        [&state.lanes.critical, &state.lanes.high, &state.lanes.normal, &state.lanes.low]
            .into_iter()
            .find_map(|lane| lane.front())
            .and_then(|id| state.tasks.get(id).cloned())
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.lanes.len()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let count = state.tasks.len();
        state.tasks.clear();
        state.by_status.clear();
        state.lanes = Lanes::default();
        info!(count, "cleared task queue");
    }

    pub async fn get_all(&self) -> Vec<Task> {
        self.state.lock().await.tasks.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use std::collections::HashSet;

    fn task(priority: Priority) -> Task {
        Task::new(&SystemClock, "demo", priority, serde_json::json!({}))
    }

    fn now() -> chrono::DateTime<chrono::Utc> {
        SystemClock.now_utc()
    }

    #[tokio::test]
    async fn dequeues_highest_priority_first() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task(Priority::Low)).await.unwrap();
        queue.enqueue(task(Priority::Critical)).await.unwrap();
        queue.enqueue(task(Priority::Normal)).await.unwrap();

        let empty_caps = HashSet::new();
        let empty_done = HashSet::new();
        let first = queue.dequeue_for(&empty_caps, &empty_done, now()).await.unwrap();
        assert_eq!(first.priority, Priority::Critical);
    }

    #[tokio::test]
    async fn skips_tasks_missing_capabilities() {
        let queue = TaskQueue::new(10);
        let mut needs_gpu = task(Priority::Critical);
        needs_gpu.required_capabilities.insert("gpu".to_string());
        queue.enqueue(needs_gpu).await.unwrap();
        queue.enqueue(task(Priority::Low)).await.unwrap();

        let caps: HashSet<String> = HashSet::new();
        let done = HashSet::new();
        let dequeued = queue.dequeue_for(&caps, &done, now()).await.unwrap();
        assert_eq!(dequeued.priority, Priority::Low);
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn withholds_tasks_with_incomplete_dependencies() {
        let queue = TaskQueue::new(10);
        let mut dependent = task(Priority::Critical);
        dependent.dependencies.push("upstream".to_string());
        queue.enqueue(dependent).await.unwrap();
        queue.enqueue(task(Priority::Low)).await.unwrap();

        let caps = HashSet::new();
        let done = HashSet::new();
        let dequeued = queue.dequeue_for(&caps, &done, now()).await.unwrap();
        assert_eq!(dequeued.priority, Priority::Low);
    }

    #[tokio::test]
    async fn withholds_tasks_whose_backoff_has_not_elapsed() {
        let queue = TaskQueue::new(10);
        let mut delayed = task(Priority::Critical);
        delayed.not_before = Some(now() + chrono::Duration::seconds(60));
        queue.enqueue(delayed).await.unwrap();
        queue.enqueue(task(Priority::Low)).await.unwrap();

        let caps = HashSet::new();
        let done = HashSet::new();
        let dequeued = queue.dequeue_for(&caps, &done, now()).await.unwrap();
        assert_eq!(dequeued.priority, Priority::Low);
    }

    #[tokio::test]
    async fn queue_full_rejects_enqueue() {
        let queue = TaskQueue::new(1);
        queue.enqueue(task(Priority::Low)).await.unwrap();
        let err = queue.enqueue(task(Priority::Low)).await.unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { max: 1 }));
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let queue = TaskQueue::new(10);
        let t = task(Priority::Low);
        queue.enqueue(t.clone()).await.unwrap();
        let err = queue.enqueue(t).await.unwrap_err();
        assert!(matches!(err, MeshError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn remove_pulls_task_out_of_queue() {
        let queue = TaskQueue::new(10);
        let t = task(Priority::Normal);
        let id = t.id.clone();
        queue.enqueue(t).await.unwrap();
        assert!(queue.remove(&id).await.is_some());
        assert_eq!(queue.size().await, 0);
        assert!(queue.get_task(&id).await.is_none());
    }

    #[tokio::test]
    async fn update_status_rejects_illegal_transition() {
        let queue = TaskQueue::new(10);
        let t = task(Priority::Normal);
        let id = t.id.clone();
        queue.enqueue(t).await.unwrap();

        let err = queue
            .transition(&id, TaskStatus::Completed, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transition_moves_status_index_and_lane() {
        let queue = TaskQueue::new(10);
        let t = task(Priority::Normal);
        let id = t.id.clone();
        queue.enqueue(t).await.unwrap();

        queue
            .transition(&id, TaskStatus::Assigned, |t| t.assigned_agent = Some("a1".into()))
            .await
            .unwrap();

        assert_eq!(queue.size().await, 0);
        assert!(queue.get_by_status(TaskStatus::Assigned).await.contains(&id));
        assert!(!queue.get_by_status(TaskStatus::Pending).await.contains(&id));
    }

    #[tokio::test]
    async fn cleanup_purges_old_terminal_tasks() {
        let queue = TaskQueue::new(10);
        let t = task(Priority::Normal);
        let id = t.id.clone();
        queue.enqueue(t).await.unwrap();
        queue
            .transition(&id, TaskStatus::Cancelled, |t| t.updated_at = now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        let removed = queue.cleanup(3_600_000, now()).await;
        assert_eq!(removed, 1);
        assert!(queue.get_task(&id).await.is_none());
    }
}
