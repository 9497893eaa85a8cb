use super::*;

#[test]
fn defaults_are_internally_consistent() {
    let config = OrchestratorConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.load_balancing.strategy, LoadBalancingStrategy::CapabilityBased);
}

#[test]
fn from_map_overrides_selected_fields() {
    let mut map = HashMap::new();
    map.insert("maxAgents".to_string(), "10".to_string());
    map.insert("taskQueueSize".to_string(), "500".to_string());

    let config = OrchestratorConfig::from_map(&map).unwrap();
    assert_eq!(config.max_agents, 10);
    assert_eq!(config.task_queue_size, 500);
    assert_eq!(config.heartbeat_interval_ms, crate::constants::HEARTBEAT_INTERVAL_MS);
}

#[test]
fn from_map_rejects_unknown_keys() {
    let mut map = HashMap::new();
    map.insert("totallyMadeUp".to_string(), "1".to_string());

    let err = OrchestratorConfig::from_map(&map).unwrap_err();
    match err {
        MeshError::Config(msg) => assert!(msg.contains("totallyMadeUp")),
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[test]
fn from_map_rejects_malformed_values() {
    let mut map = HashMap::new();
    map.insert("maxAgents".to_string(), "not-a-number".to_string());

    let err = OrchestratorConfig::from_map(&map).unwrap_err();
    assert!(matches!(err, MeshError::Config(_)));
}

#[test]
fn from_map_validates_retry_policy() {
    let mut map = HashMap::new();
    map.insert("retryPolicy.backoffMultiplier".to_string(), "0.5".to_string());

    let err = OrchestratorConfig::from_map(&map).unwrap_err();
    assert!(matches!(err, MeshError::Config(_)));
}

#[test]
fn load_balancing_strategy_parses_known_values() {
    let mut map = HashMap::new();
    map.insert("loadBalancing.strategy".to_string(), "round_robin".to_string());
    let config = OrchestratorConfig::from_map(&map).unwrap();
    assert_eq!(config.load_balancing.strategy, LoadBalancingStrategy::RoundRobin);

    map.insert("loadBalancing.strategy".to_string(), "bogus".to_string());
    assert!(OrchestratorConfig::from_map(&map).is_err());
}

#[test]
fn retry_policy_backoff_grows_exponentially() {
    let policy = RetryPolicy {
        max_retries: 5,
        backoff_ms: 100,
        backoff_multiplier: 2.0,
    };
    assert_eq!(policy.delay_for_attempt(1), 100);
    assert_eq!(policy.delay_for_attempt(2), 200);
    assert_eq!(policy.delay_for_attempt(3), 400);
}
