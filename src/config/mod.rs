use crate::error::{MeshError, Result};
use std::collections::{HashMap, HashSet};
use std::env;

/// Strategy the registry uses when `findBestAgent` has more than one
/// eligible candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastBusy,
    CapabilityBased,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        LoadBalancingStrategy::CapabilityBased
    }
}

impl std::str::FromStr for LoadBalancingStrategy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least_busy" => Ok(LoadBalancingStrategy::LeastBusy),
            "capability_based" => Ok(LoadBalancingStrategy::CapabilityBased),
            other => Err(MeshError::Config(format!(
                "unknown loadBalancing.strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            backoff_ms: crate::constants::DEFAULT_BACKOFF_MS,
            backoff_multiplier: crate::constants::DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`-th retry (1-indexed), exponential
    /// backoff off `backoff_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        (self.backoff_ms as f64 * factor) as u64
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancing {
    pub strategy: LoadBalancingStrategy,
}

impl Default for LoadBalancing {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::default(),
        }
    }
}

/// Typed configuration tree for the orchestration core (spec.md §6
/// `OrchestratorConfig`). Unlike the host-facing `Config` a Discord/API
/// deployment would layer on top, this struct knows nothing about
/// external collaborators — only the knobs the core itself reads.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub task_queue_size: usize,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub task_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub load_balancing: LoadBalancing,
    pub drain_deadline_ms: u64,
    pub dispatch_interval_ms: u64,
    pub max_history_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: crate::constants::MAX_AGENTS,
            task_queue_size: crate::constants::MAX_QUEUE_SIZE,
            heartbeat_interval_ms: crate::constants::HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: crate::constants::HEARTBEAT_TIMEOUT_MS,
            task_timeout_ms: crate::constants::DEFAULT_TASK_TIMEOUT_MS,
            retry_policy: RetryPolicy::default(),
            load_balancing: LoadBalancing::default(),
            drain_deadline_ms: crate::constants::DEFAULT_DRAIN_DEADLINE_MS,
            dispatch_interval_ms: crate::constants::DISPATCH_INTERVAL_MS,
            max_history_size: crate::constants::DEFAULT_MAX_HISTORY_SIZE,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "maxAgents",
    "taskQueueSize",
    "heartbeatIntervalMs",
    "heartbeatTimeoutMs",
    "taskTimeoutMs",
    "retryPolicy.maxRetries",
    "retryPolicy.backoffMs",
    "retryPolicy.backoffMultiplier",
    "loadBalancing.strategy",
    "drainDeadlineMs",
    "dispatchIntervalMs",
    "maxHistorySize",
];

impl OrchestratorConfig {
    /// Builds a config from a flat string map, rejecting any key that
    /// isn't one the core understands. This is the constructor hosts
    /// use when config arrives as untyped key/value pairs (env vars,
    /// a parsed file) rather than as Rust struct literals.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
        for key in map.keys() {
            if !known.contains(key.as_str()) {
                return Err(MeshError::Config(format!("unknown config key: {key}")));
            }
        }

        let mut config = OrchestratorConfig::default();

        if let Some(v) = map.get("maxAgents") {
            config.max_agents = parse_field(v, "maxAgents")?;
        }
        if let Some(v) = map.get("taskQueueSize") {
            config.task_queue_size = parse_field(v, "taskQueueSize")?;
        }
        if let Some(v) = map.get("heartbeatIntervalMs") {
            config.heartbeat_interval_ms = parse_field(v, "heartbeatIntervalMs")?;
        }
        if let Some(v) = map.get("heartbeatTimeoutMs") {
            config.heartbeat_timeout_ms = parse_field(v, "heartbeatTimeoutMs")?;
        }
        if let Some(v) = map.get("taskTimeoutMs") {
            config.task_timeout_ms = parse_field(v, "taskTimeoutMs")?;
        }
        if let Some(v) = map.get("retryPolicy.maxRetries") {
            config.retry_policy.max_retries = parse_field(v, "retryPolicy.maxRetries")?;
        }
        if let Some(v) = map.get("retryPolicy.backoffMs") {
            config.retry_policy.backoff_ms = parse_field(v, "retryPolicy.backoffMs")?;
        }
        if let Some(v) = map.get("retryPolicy.backoffMultiplier") {
            config.retry_policy.backoff_multiplier =
                parse_field(v, "retryPolicy.backoffMultiplier")?;
        }
        if let Some(v) = map.get("loadBalancing.strategy") {
            config.load_balancing.strategy = v.parse()?;
        }
        if let Some(v) = map.get("drainDeadlineMs") {
            config.drain_deadline_ms = parse_field(v, "drainDeadlineMs")?;
        }
        if let Some(v) = map.get("dispatchIntervalMs") {
            config.dispatch_interval_ms = parse_field(v, "dispatchIntervalMs")?;
        }
        if let Some(v) = map.get("maxHistorySize") {
            config.max_history_size = parse_field(v, "maxHistorySize")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads config from process environment variables, the way a host
    /// binary wires things up (`.env` via dotenvy, then `std::env`).
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {e}"),
        }

        let mut map = HashMap::new();
        for key in KNOWN_KEYS {
            let env_key = to_env_key(key);
            if let Ok(value) = env::var(&env_key) {
                map.insert((*key).to_string(), value);
            }
        }
        Self::from_map(&map)
    }

    fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(MeshError::Config("maxAgents must be > 0".into()));
        }
        if self.task_queue_size == 0 {
            return Err(MeshError::Config("taskQueueSize must be > 0".into()));
        }
        if self.retry_policy.backoff_multiplier < 1.0 {
            return Err(MeshError::Config(
                "retryPolicy.backoffMultiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn to_env_key(dotted: &str) -> String {
    dotted
        .chars()
        .map(|c| if c == '.' { '_' } else { c })
        .collect::<String>()
        .chars()
        .fold(String::new(), |mut acc, c| {
            if c.is_uppercase() && !acc.is_empty() {
                acc.push('_');
            }
            acc.push(c.to_ascii_uppercase());
            acc
        })
}

fn parse_field<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| MeshError::Config(format!("invalid value for {field}: {raw}")))
}

#[cfg(test)]
mod tests;
