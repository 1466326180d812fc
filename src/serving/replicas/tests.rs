use super::*;
use crate::config::ServingConfig;

fn registry(endpoints: usize, config: ServingConfig) -> ReplicaRegistry {
    let endpoints: Vec<String> = (0..endpoints)
        .map(|i| format!("http://replica-{i}:8700"))
        .collect();
    ReplicaRegistry::new(&endpoints, &config, Arc::new(Metrics::default()))
        .expect("Failed to build registry")
}

#[test]
fn selects_least_loaded_healthy_replica() {
    let registry = registry(3, ServingConfig::default());

    // Successive selections spread across idle replicas.
    let g0 = registry.select(None).expect("no replica");
    let g1 = registry.select(None).expect("no replica");
    let g2 = registry.select(None).expect("no replica");
    assert_eq!(
        (g0.replica().id, g1.replica().id, g2.replica().id),
        (0, 1, 2)
    );

    // With loads equal again the tie breaks by id.
    let guard = registry.select(None).expect("no replica");
    assert_eq!(guard.replica().id, 0);
}

#[test]
fn load_guard_releases_on_drop() {
    let registry = registry(1, ServingConfig::default());

    let guard = registry.select(None).expect("no replica");
    assert_eq!(guard.replica().load(), 1);
    drop(guard);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].load, 0);
}

#[test]
fn exclusion_skips_failed_replica() {
    let registry = registry(2, ServingConfig::default());
    let guard = registry.select(Some(0)).expect("no replica");
    assert_eq!(guard.replica().id, 1);

    // Excluding the only other replica leaves nothing.
    let registry = registry_with_one_unhealthy();
    assert!(registry.select(Some(1)).is_none());
}

fn registry_with_one_unhealthy() -> ReplicaRegistry {
    let config = ServingConfig {
        unhealthy_after: 1,
        ..ServingConfig::default()
    };
    let registry = registry(2, config);
    registry.record_probe(0, false);
    registry
}

#[test]
fn unhealthy_replicas_receive_no_traffic() {
    let config = ServingConfig {
        unhealthy_after: 2,
        ..ServingConfig::default()
    };
    let registry = registry(2, config);

    registry.record_probe(0, false);
    registry.record_probe(0, false);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Unhealthy);

    for _ in 0..5 {
        let guard = registry.select(None).expect("no replica");
        assert_eq!(guard.replica().id, 1);
    }
}

#[test]
fn degraded_replicas_receive_reduced_share() {
    let config = ServingConfig {
        degraded_load_penalty: 4,
        ..ServingConfig::default()
    };
    let registry = registry(2, config);

    // One failed probe degrades a healthy replica without removing it.
    registry.record_probe(0, false);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Degraded);

    // At equal (idle) load the healthy replica wins.
    let g1 = registry.select(None).expect("no replica");
    assert_eq!(g1.replica().id, 1);

    // Only under enough load on the healthy replica does the degraded one
    // see traffic.
    let _g2 = registry.select(None).expect("no replica");
    let mut guards = vec![g1, _g2];
    loop {
        let guard = registry.select(None).expect("no replica");
        let id = guard.replica().id;
        guards.push(guard);
        if id == 0 {
            break;
        }
        assert!(guards.len() < 32, "degraded replica never selected");
    }
}

#[test]
fn hysteresis_requires_consecutive_successes() {
    let config = ServingConfig {
        unhealthy_after: 2,
        healthy_after: 3,
        ..ServingConfig::default()
    };
    let registry = registry(1, config);

    registry.record_probe(0, false);
    registry.record_probe(0, false);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Unhealthy);

    // Two successes are not enough.
    registry.record_probe(0, true);
    registry.record_probe(0, true);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Unhealthy);

    // An interleaved failure resets the streak.
    registry.record_probe(0, false);
    registry.record_probe(0, true);
    registry.record_probe(0, true);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Unhealthy);

    registry.record_probe(0, true);
    assert_eq!(registry.snapshot()[0].state, ReplicaState::Healthy);
}

#[test]
fn transitions_are_counted() {
    let metrics = Arc::new(Metrics::default());
    let config = ServingConfig {
        unhealthy_after: 1,
        healthy_after: 1,
        ..ServingConfig::default()
    };
    let registry = ReplicaRegistry::new(
        &["http://replica-0:8700".to_string()],
        &config,
        Arc::clone(&metrics),
    )
    .expect("Failed to build registry");

    registry.record_probe(0, false);
    registry.record_probe(0, false); // already unhealthy, no transition
    registry.record_probe(0, true);

    assert_eq!(
        metrics
            .replica_transitions
            .load(std::sync::atomic::Ordering::Relaxed),
        2
    );
}

#[test]
fn rejects_invalid_endpoint() {
    let result = ReplicaRegistry::new(
        &["not a url".to_string()],
        &ServingConfig::default(),
        Arc::new(Metrics::default()),
    );
    assert!(result.is_err());
}
