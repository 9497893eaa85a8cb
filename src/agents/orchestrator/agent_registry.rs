//! Capability, status, and tag indexed agent directory (spec.md §4
//! Agent Registry). Keeps three auxiliary indexes in lock-step with the
//! primary record on every mutation.

use crate::clock::Clock;
use crate::error::{MeshError, Result};
use crate::events::{Event, EventSink};
use crate::models::{AgentConfig, AgentMetrics, AgentStatus, RegisteredAgent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Conjunctive query for [`AgentRegistry::find_agents`]. Empty
/// `capabilities`/`tags` match anything; `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub capabilities: HashSet<String>,
    pub tags: HashSet<String>,
    pub min_last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

/// Directory-wide aggregate counts (spec.md §4.2 `getStats`).
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: HashMap<AgentStatus, usize>,
    pub by_capability: HashMap<String, usize>,
    pub average_load_ratio: f64,
}

fn score_agent(
    agent: &RegisteredAgent,
    preferred_capabilities: &HashSet<String>,
    now: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let matched_preferred = preferred_capabilities
        .intersection(&agent.config.capabilities)
        .count() as f64;
    let max_concurrent = agent.config.max_concurrent_tasks.max(1) as f64;
    let load_ratio = agent.metrics.tasks_in_progress as f64 / max_concurrent;
    let mut score = 10.0 * matched_preferred - 20.0 * load_ratio;
    if (now - agent.last_heartbeat_at).num_milliseconds() <= 30_000 {
        score += 5.0;
    }
    score
}

struct Indexes {
    records: HashMap<String, RegisteredAgent>,
    by_capability: HashMap<String, HashSet<String>>,
    by_status: HashMap<AgentStatus, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl Indexes {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            by_capability: HashMap::new(),
            by_status: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    fn index_agent(&mut self, agent: &RegisteredAgent) {
        for cap in &agent.config.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(agent.id.clone());
        }
        for tag in &agent.config.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(agent.id.clone());
        }
        self.by_status
            .entry(agent.status)
            .or_default()
            .insert(agent.id.clone());
    }

    fn unindex_agent(&mut self, agent: &RegisteredAgent) {
        for cap in &agent.config.capabilities {
            if let Some(set) = self.by_capability.get_mut(cap) {
                set.remove(&agent.id);
            }
        }
        for tag in &agent.config.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&agent.id);
            }
        }
        if let Some(set) = self.by_status.get_mut(&agent.status) {
            set.remove(&agent.id);
        }
    }

    fn move_status(&mut self, agent_id: &str, from: AgentStatus, to: AgentStatus) {
        if let Some(set) = self.by_status.get_mut(&from) {
            set.remove(agent_id);
        }
        self.by_status.entry(to).or_default().insert(agent_id.to_string());
    }
}

/// Service struct owning the agent directory. Cloneable handle over
/// shared state, matching the rest of the component set.
#[derive(Clone)]
pub struct AgentRegistry {
    indexes: Arc<RwLock<Indexes>>,
    heartbeat_timeout_ms: i64,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout_ms: u64, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            indexes: Arc::new(RwLock::new(Indexes::new())),
            heartbeat_timeout_ms: heartbeat_timeout_ms as i64,
            clock,
            events,
        }
    }

    pub async fn register(&self, id: String, config: AgentConfig) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        if indexes.records.contains_key(&id) {
            return Err(MeshError::Duplicate { id });
        }

        let now = self.clock.now_utc();
        let record = RegisteredAgent {
            id: id.clone(),
            config,
            status: AgentStatus::Starting,
            metrics: AgentMetrics::default(),
            registered_at: now,
            last_heartbeat_at: now,
        };

        indexes.index_agent(&record);
        indexes.records.insert(id.clone(), record);
        drop(indexes);

        info!(agent_id = %id, "agent registered");
        self.events.emit(Event::AgentRegistered { agent_id: id }).await;
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        let record = indexes
            .records
            .remove(id)
            .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;
        indexes.unindex_agent(&record);
        drop(indexes);

        info!(agent_id = %id, "agent unregistered");
        self.events
            .emit(Event::AgentUnregistered { agent_id: id.to_string() })
            .await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<RegisteredAgent> {
        self.indexes.read().await.records.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<RegisteredAgent> {
        self.indexes.read().await.records.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.indexes.read().await.records.len()
    }

    pub async fn set_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        let previous = {
            let record = indexes
                .records
                .get_mut(id)
                .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;
            let previous = record.status;
            record.status = status;
            previous
        };
        indexes.move_status(id, previous, status);
        Ok(())
    }

    pub async fn record_heartbeat(&self, id: &str) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        let now = self.clock.now_utc();
        let record = indexes
            .records
            .get_mut(id)
            .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;
        record.last_heartbeat_at = now;
        drop(indexes);
        self.events
            .emit(Event::AgentHeartbeat { agent_id: id.to_string() })
            .await;
        Ok(())
    }

    pub async fn update_metrics(&self, id: &str, f: impl FnOnce(&mut AgentMetrics)) -> Result<()> {
        let mut indexes = self.indexes.write().await;
        let record = indexes
            .records
            .get_mut(id)
            .ok_or_else(|| MeshError::NotFound { id: id.to_string() })?;
        f(&mut record.metrics);
        Ok(())
    }

    pub async fn by_capability(&self, capability: &str) -> HashSet<String> {
        self.indexes
            .read()
            .await
            .by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn by_status(&self, status: AgentStatus) -> HashSet<String> {
        self.indexes
            .read()
            .await
            .by_status
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn by_tag(&self, tag: &str) -> HashSet<String> {
        self.indexes
            .read()
            .await
            .by_tag
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Best idle candidate for a task requiring `required_capabilities`,
    /// preferring agents that also hold `preferred_capabilities` and
    /// skipping anything in `exclude`. Scores each eligible agent as
    /// `10 * matched_preferred - 20 * load_ratio (+5 if the heartbeat is
    /// within the last 30s)`, breaking ties lexicographically by id.
    /// Returns `None` when no agent qualifies — the registry never
    /// falls back to an unqualified agent.
    pub async fn find_best_agent(
        &self,
        required_capabilities: &HashSet<String>,
        preferred_capabilities: &HashSet<String>,
        exclude: &HashSet<String>,
    ) -> Option<String> {
        let now = self.clock.now_utc();
        let indexes = self.indexes.read().await;
        let idle_ids = indexes.by_status.get(&AgentStatus::Idle)?;

        idle_ids
            .iter()
            .filter(|id| !exclude.contains(id.as_str()))
            .filter_map(|id| indexes.records.get(id))
            .filter(|agent| required_capabilities.is_subset(&agent.config.capabilities))
            .map(|agent| (agent.id.clone(), score_agent(agent, preferred_capabilities, now)))
            .fold(None::<(String, f64)>, |best, (id, score)| match best {
                Some((best_id, best_score)) if best_score > score || (best_score == score && best_id < id) => {
                    Some((best_id, best_score))
                }
                _ => Some((id, score)),
            })
            .map(|(id, _)| id)
    }

    /// Agents matching every non-empty clause of `filter` (spec.md §4.2
    /// `findAgents`).
    pub async fn find_agents(&self, filter: &AgentFilter) -> Vec<RegisteredAgent> {
        let indexes = self.indexes.read().await;
        let mut matches: Vec<RegisteredAgent> = indexes
            .records
            .values()
            .filter(|agent| filter.status.map_or(true, |s| agent.status == s))
            .filter(|agent| filter.capabilities.is_subset(&agent.config.capabilities))
            .filter(|agent| filter.tags.is_subset(&agent.config.tags))
            .filter(|agent| {
                filter
                    .min_last_heartbeat
                    .map_or(true, |min| agent.last_heartbeat_at >= min)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|agent| agent.last_heartbeat_at);
        matches
    }

    /// Aggregate counts over the whole directory (spec.md §4.2
    /// `getStats`).
    pub async fn get_stats(&self) -> RegistryStats {
        let indexes = self.indexes.read().await;
        let mut by_status = HashMap::new();
        let mut by_capability = HashMap::new();
        let mut load_ratio_sum = 0.0;

        for agent in indexes.records.values() {
            *by_status.entry(agent.status).or_insert(0) += 1;
            for cap in &agent.config.capabilities {
                *by_capability.entry(cap.clone()).or_insert(0) += 1;
            }
            let max_concurrent = agent.config.max_concurrent_tasks.max(1) as f64;
            load_ratio_sum += agent.metrics.tasks_in_progress as f64 / max_concurrent;
        }

        let total = indexes.records.len();
        RegistryStats {
            total,
            by_status,
            by_capability,
            average_load_ratio: if total == 0 {
                0.0
            } else {
                load_ratio_sum / total as f64
            },
        }
    }

    /// Sweeps for agents whose last heartbeat is older than the
    /// configured timeout, emitting `agent.stale` for each. Does not
    /// unregister them — staleness is a signal, not a removal.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let now = self.clock.now_utc();
        let stale_ids: Vec<String> = {
            let indexes = self.indexes.read().await;
            indexes
                .records
                .values()
                .filter(|agent| {
                    (now - agent.last_heartbeat_at).num_milliseconds() > self.heartbeat_timeout_ms
                })
                .map(|agent| agent.id.clone())
                .collect()
        };

        for id in &stale_ids {
            warn!(agent_id = %id, "agent heartbeat stale");
            self.events.emit(Event::AgentStale { agent_id: id.clone() }).await;
        }
        stale_ids
    }
}
