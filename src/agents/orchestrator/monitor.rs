//! Per-agent performance history, alerting, and aggregated health
//! (spec.md §4 Monitor). Grounded on the teacher's
//! `monitoring::SystemMonitor` background-task lifecycle, narrowed from
//! whole-process resource metrics down to per-agent sampling.

use crate::clock::Clock;
use crate::constants::{
    ALERT_COOLDOWN_AGENT_OFFLINE_MS, ALERT_COOLDOWN_HIGH_FAILURE_MS, ALERT_COOLDOWN_SLOW_RESPONSE_MS,
    ALERT_MIN_SAMPLES_HIGH_FAILURE_RATE, ALERT_THRESHOLD_HIGH_FAILURE_RATE, ALERT_THRESHOLD_SLOW_RESPONSE_MS,
};
use crate::error::{MeshError, Result};
use crate::events::{AlertSeverity, Event, EventSink};
use crate::models::{AlertMetric, AlertRule, PerformanceSample};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

struct AgentHistory {
    samples: VecDeque<PerformanceSample>,
    max_size: usize,
}

impl AgentHistory {
    fn new(max_size: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            max_size,
        }
    }

    fn push(&mut self, sample: PerformanceSample) {
        if self.samples.len() >= self.max_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedMetrics {
    pub sample_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub average_duration_ms: f64,
}

impl AggregatedMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.sample_count as f64
        }
    }
}

/// System-wide roll-up across every agent currently being monitored.
#[derive(Debug, Clone, Default)]
pub struct SystemMetrics {
    pub monitored_agent_count: usize,
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub unhealthy_count: usize,
    pub average_failure_rate: f64,
}

/// Everything a host dashboard needs in one call: system roll-up plus
/// per-agent aggregates over the default window.
#[derive(Debug, Clone, Default)]
pub struct DashboardData {
    pub system: SystemMetrics,
    pub per_agent: HashMap<String, AggregatedMetrics>,
}

#[derive(Clone)]
pub struct Monitor {
    histories: Arc<RwLock<HashMap<String, AgentHistory>>>,
    rules: Arc<RwLock<Vec<AlertRule>>>,
    cooldowns: Arc<RwLock<HashMap<(String, String), chrono::DateTime<chrono::Utc>>>>,
    stopped: Arc<RwLock<HashSet<String>>>,
    max_history_size: usize,
    healthy_window_ms: i64,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Monitor {
    pub fn new(
        max_history_size: usize,
        healthy_window_ms: i64,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            histories: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(RwLock::new(default_rules())),
            cooldowns: Arc::new(RwLock::new(HashMap::new())),
            stopped: Arc::new(RwLock::new(HashSet::new())),
            max_history_size,
            healthy_window_ms,
            clock,
            events,
        }
    }

    /// Begins accepting samples and evaluating alert rules for
    /// `agent_id`. Monitoring is on by default for any agent that has
    /// never been stopped; this only needs to be called to resume
    /// after a prior `stop_monitoring`.
    pub async fn start_monitoring(&self, agent_id: &str) {
        self.stopped.write().await.remove(agent_id);
    }

    /// Stops accepting samples and evaluating alert rules for
    /// `agent_id` until `start_monitoring` is called again. Existing
    /// history is kept, just not added to.
    pub async fn stop_monitoring(&self, agent_id: &str) {
        self.stopped.write().await.insert(agent_id.to_string());
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.rules.write().await.push(rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) {
        self.rules.write().await.retain(|r| r.id != rule_id);
    }

    pub async fn list_rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| MeshError::NotFound { id: rule_id.to_string() })?;
        rule.enabled = enabled;
        Ok(())
    }

    pub async fn record_sample(&self, sample: PerformanceSample) {
        let agent_id = sample.agent_id.clone();
        if self.stopped.read().await.contains(&agent_id) {
            return;
        }
        {
            let mut histories = self.histories.write().await;
            histories
                .entry(agent_id.clone())
                .or_insert_with(|| AgentHistory::new(self.max_history_size))
                .push(sample);
        }
        self.evaluate_rules(&agent_id).await;
    }

    pub async fn aggregate(&self, agent_id: &str, window_ms: i64) -> AggregatedMetrics {
        let now = self.clock.now_utc();
        let histories = self.histories.read().await;
        let Some(history) = histories.get(agent_id) else {
            return AggregatedMetrics::default();
        };

        let relevant: Vec<&PerformanceSample> = history
            .samples
            .iter()
            .filter(|s| (now - s.timestamp).num_milliseconds() <= window_ms)
            .collect();

        let sample_count = relevant.len();
        let success_count = relevant.iter().filter(|s| s.success).count();
        let failure_count = sample_count - success_count;
        let average_duration_ms = if sample_count == 0 {
            0.0
        } else {
            relevant.iter().map(|s| s.task_duration_ms as f64).sum::<f64>() / sample_count as f64
        };

        AggregatedMetrics {
            sample_count,
            success_count,
            failure_count,
            average_duration_ms,
        }
    }

    /// Returns the 5-minute aggregate for `agent_id`, or `Unknown` if
    /// no sample has ever been recorded for it.
    pub async fn get_metrics(&self, agent_id: &str) -> Result<AggregatedMetrics> {
        if !self.histories.read().await.contains_key(agent_id) {
            return Err(MeshError::Unknown { id: agent_id.to_string() });
        }
        Ok(self.aggregate(agent_id, 5 * 60_000).await)
    }

    /// Raw sample history for `agent_id`, oldest first.
    pub async fn get_performance_history(&self, agent_id: &str) -> Vec<PerformanceSample> {
        self.histories
            .read()
            .await
            .get(agent_id)
            .map(|h| h.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_system_metrics(&self) -> SystemMetrics {
        let agent_ids: Vec<String> = self.histories.read().await.keys().cloned().collect();
        let mut system = SystemMetrics {
            monitored_agent_count: agent_ids.len(),
            ..Default::default()
        };

        let mut failure_rate_total = 0.0;
        for agent_id in &agent_ids {
            match self.health_status(agent_id).await {
                HealthStatus::Healthy => system.healthy_count += 1,
                HealthStatus::Degraded => system.degraded_count += 1,
                HealthStatus::Unhealthy => system.unhealthy_count += 1,
            }
            failure_rate_total += self.aggregate(agent_id, 5 * 60_000).await.failure_rate();
        }
        if !agent_ids.is_empty() {
            system.average_failure_rate = failure_rate_total / agent_ids.len() as f64;
        }
        system
    }

    pub async fn get_dashboard_data(&self) -> DashboardData {
        let agent_ids: Vec<String> = self.histories.read().await.keys().cloned().collect();
        let mut per_agent = HashMap::new();
        for agent_id in &agent_ids {
            per_agent.insert(agent_id.clone(), self.aggregate(agent_id, 5 * 60_000).await);
        }
        DashboardData {
            system: self.get_system_metrics().await,
            per_agent,
        }
    }

    pub async fn health_status(&self, agent_id: &str) -> HealthStatus {
        let now = self.clock.now_utc();
        let histories = self.histories.read().await;
        let Some(history) = histories.get(agent_id) else {
            return HealthStatus::Unhealthy;
        };

        match history.samples.back() {
            Some(latest) if (now - latest.timestamp).num_milliseconds() <= self.healthy_window_ms => {
                let recent_failures = history
                    .samples
                    .iter()
                    .rev()
                    .take(10)
                    .filter(|s| !s.success)
                    .count();
                if recent_failures >= 5 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            Some(_) => HealthStatus::Unhealthy,
            None => HealthStatus::Unhealthy,
        }
    }

    async fn evaluate_rules(&self, agent_id: &str) {
        let rules = self.rules.read().await.clone();
        for rule in rules {
            if !rule.enabled {
                continue;
            }

            let agg = self.aggregate(agent_id, 5 * 60_000).await;
            if agg.sample_count < rule.min_samples {
                continue;
            }

            let triggered = match rule.metric {
                AlertMetric::FailureRate => agg.failure_rate() >= rule.threshold,
                AlertMetric::AverageResponseTimeMs => agg.average_duration_ms >= rule.threshold,
                AlertMetric::AgentOffline => {
                    matches!(self.health_status(agent_id).await, HealthStatus::Unhealthy)
                }
            };

            if !triggered {
                continue;
            }

            if self.in_cooldown(&rule.id, agent_id, rule.cooldown_ms).await {
                continue;
            }

            self.mark_cooldown(&rule.id, agent_id).await;
            debug!(rule_id = %rule.id, agent_id, "alert rule triggered");
            self.events
                .emit(Event::MonitorAlert {
                    rule_id: rule.id.clone(),
                    agent_id: agent_id.to_string(),
                    severity: severity_for(&rule),
                    message: format!("rule {} triggered for agent {agent_id}", rule.id),
                })
                .await;
        }
    }

    async fn in_cooldown(&self, rule_id: &str, agent_id: &str, cooldown_ms: i64) -> bool {
        let cooldowns = self.cooldowns.read().await;
        let key = (rule_id.to_string(), agent_id.to_string());
        match cooldowns.get(&key) {
            Some(last) => (self.clock.now_utc() - *last).num_milliseconds() < cooldown_ms,
            None => false,
        }
    }

    async fn mark_cooldown(&self, rule_id: &str, agent_id: &str) {
        let mut cooldowns = self.cooldowns.write().await;
        cooldowns.insert((rule_id.to_string(), agent_id.to_string()), self.clock.now_utc());
    }
}

fn severity_for(rule: &AlertRule) -> AlertSeverity {
    rule.severity
}

/// The three built-in rules every `Monitor` ships with (spec.md §4
/// default alert set).
fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "high-failure-rate".into(),
            metric: AlertMetric::FailureRate,
            threshold: ALERT_THRESHOLD_HIGH_FAILURE_RATE,
            severity: AlertSeverity::High,
            cooldown_ms: ALERT_COOLDOWN_HIGH_FAILURE_MS,
            min_samples: ALERT_MIN_SAMPLES_HIGH_FAILURE_RATE,
            enabled: true,
        },
        AlertRule {
            id: "slow-response".into(),
            metric: AlertMetric::AverageResponseTimeMs,
            threshold: ALERT_THRESHOLD_SLOW_RESPONSE_MS,
            severity: AlertSeverity::Medium,
            cooldown_ms: ALERT_COOLDOWN_SLOW_RESPONSE_MS,
            min_samples: 1,
            enabled: true,
        },
        AlertRule {
            id: "agent-offline".into(),
            metric: AlertMetric::AgentOffline,
            threshold: 0.0,
            severity: AlertSeverity::Critical,
            cooldown_ms: ALERT_COOLDOWN_AGENT_OFFLINE_MS,
            min_samples: 1,
            enabled: true,
        },
    ]
}
