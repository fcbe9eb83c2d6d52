//! End-to-end routing behavior against scripted collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use adaptive_lb::config::{CircuitBreakerConfig, RateLimitConfig, ServerSpec};
use adaptive_lb::error::{ConfigurationError, FailureReason, RouteError};
use adaptive_lb::load_balancer::backend::{LifecycleState, ServerId};
use adaptive_lb::load_balancer::registry;
use adaptive_lb::resilience::CircuitState;
use adaptive_lb::routing::Dispatcher;
use tokio::task::JoinSet;
use tokio::time;

mod common;
use common::{get, pool_with, settings, Behavior, ScriptedUpstream, StaticProbe};

#[tokio::test(start_paused = true)]
async fn test_all_retries_failed_after_exact_attempts_with_growing_delays() {
    let upstream = ScriptedUpstream::new();
    for id in ["a", "b", "c"] {
        upstream.set(id, Behavior::Status(503));
    }
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a", "b", "c"]);

    let err = d.route("web", get()).await.unwrap_err();
    let RouteError::AllRetriesFailed { attempts } = err else {
        panic!("expected AllRetriesFailed, got {:?}", err);
    };
    assert_eq!(attempts.len(), 3);
    // Each retry avoids the servers that already failed.
    let mut servers: Vec<&str> = attempts.iter().map(|a| a.server.as_str()).collect();
    servers.sort();
    assert_eq!(servers, vec!["a", "b", "c"]);
    assert!(attempts
        .iter()
        .all(|a| matches!(a.reason, FailureReason::Downstream(_))));

    let times = upstream.call_times();
    assert_eq!(times.len(), 3);
    let first = times[1] - times[0];
    let second = times[2] - times[1];
    assert!(first >= Duration::from_millis(100));
    assert!(second > first, "{:?} should exceed {:?}", second, first);
}

#[tokio::test(start_paused = true)]
async fn test_failover_skips_failed_server() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Fail);
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a", "b"]);

    let routed = d.route("web", get()).await.unwrap();
    assert_eq!(routed.server.as_str(), "b");
    assert_eq!(routed.attempts, 2);
    assert_eq!(routed.failures.len(), 1);
    assert_eq!(&routed.response.body[..], b"b");
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_lifecycle() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Fail);
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.failover.max_retries = 1;
    rules.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout_ms: 30_000,
        half_open_limit: 2,
    };
    pool_with(&d, "web", rules, &["a"]);

    for _ in 0..3 {
        assert!(matches!(d.route("web", get()).await, Err(RouteError::Downstream { .. })));
    }
    assert_eq!(d.server_status("a").unwrap().circuit.state, CircuitState::Open);

    // Rejected without touching the server.
    assert!(matches!(d.route("web", get()).await, Err(RouteError::CircuitOpen { .. })));
    assert_eq!(upstream.count("a"), 3);

    time::advance(Duration::from_secs(30)).await;
    upstream.set("a", Behavior::Ok);

    d.route("web", get()).await.unwrap();
    assert_eq!(upstream.count("a"), 4);
    let circuit = d.server_status("a").unwrap().circuit;
    assert_eq!(circuit.state, CircuitState::HalfOpen);
    assert_eq!(circuit.success_count, 1);

    d.route("web", get()).await.unwrap();
    let circuit = d.server_status("a").unwrap().circuit;
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failure_count, 0);
    assert_eq!(circuit.success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Fail);
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.failover.max_retries = 1;
    rules.circuit_breaker.failure_threshold = 1;
    pool_with(&d, "web", rules, &["a"]);

    d.route("web", get()).await.unwrap_err();
    time::advance(Duration::from_secs(30)).await;

    // The trial call fails and the breaker opens again.
    assert!(matches!(d.route("web", get()).await, Err(RouteError::Downstream { .. })));
    assert_eq!(d.server_status("a").unwrap().circuit.state, CircuitState::Open);
    assert!(matches!(d.route("web", get()).await, Err(RouteError::CircuitOpen { .. })));
    assert_eq!(upstream.count("a"), 2);
}

#[tokio::test]
async fn test_weighted_round_robin_proportions() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.algorithm = registry::WEIGHTED_ROUND_ROBIN.to_string();
    d.create_pool("web", rules).unwrap();
    for (id, weight) in [("a", 3), ("b", 2), ("c", 1)] {
        d.add_server("web", &ServerSpec::new(id, "10.0.0.1", 80).weight(weight))
            .unwrap();
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..600 {
        let routed = d.route("web", get()).await.unwrap();
        *counts.entry(routed.server.to_string()).or_default() += 1;
    }
    assert_eq!(counts["a"], 300);
    assert_eq!(counts["b"], 200);
    assert_eq!(counts["c"], 100);
}

#[tokio::test(start_paused = true)]
async fn test_session_affinity_rebinds_after_removal() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a", "b", "c"]);

    let first = d.route("web", get().session("user-7")).await.unwrap().server;
    for _ in 0..3 {
        // Unrelated traffic moves the round-robin pointer.
        d.route("web", get()).await.unwrap();
        let again = d.route("web", get().session("user-7")).await.unwrap().server;
        assert_eq!(again, first);
    }

    d.remove_server(first.as_str(), true).await.unwrap();

    let rebound = d.route("web", get().session("user-7")).await.unwrap().server;
    assert_ne!(rebound, first);
    for _ in 0..3 {
        d.route("web", get()).await.unwrap();
        let again = d.route("web", get().session("user-7")).await.unwrap().server;
        assert_eq!(again, rebound);
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_binding_survives_rate_limit_burst() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.rate_limit = RateLimitConfig {
        enabled: true,
        max_requests: 1,
        window_ms: 1_000,
        pool_max_requests: None,
    };
    pool_with(&d, "web", rules, &["a", "b"]);

    let first = d.route("web", get().session("u")).await.unwrap().server;

    // The bound server's window is full: served elsewhere, binding kept.
    let second = d.route("web", get().session("u")).await.unwrap().server;
    assert_ne!(second, first);

    time::advance(Duration::from_secs(2)).await;
    let third = d.route("web", get().session("u")).await.unwrap().server;
    assert_eq!(third, first);
}

#[tokio::test(start_paused = true)]
async fn test_session_binding_survives_full_connection_slots() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Slow(Duration::from_secs(5)));
    let d = Arc::new(common::dispatcher(upstream.clone()));
    d.create_pool("web", settings()).unwrap();
    d.add_server("web", &ServerSpec::new("a", "10.0.0.1", 80).max_connections(1))
        .unwrap();
    d.add_server("web", &ServerSpec::new("b", "10.0.0.2", 80)).unwrap();

    let bound = d.route("web", get().session("u")).await.unwrap().server;
    assert_eq!(bound.as_str(), "a");

    // Hold a's only slot with a slow call.
    let busy = {
        let d = d.clone();
        tokio::spawn(async move { d.route("web", get().session("u")).await })
    };
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(d.server_status("a").unwrap().active_connections, 1);

    upstream.set("a", Behavior::Ok);
    let during = d.route("web", get().session("u")).await.unwrap().server;
    assert_eq!(during.as_str(), "b");

    assert_eq!(busy.await.unwrap().unwrap().server.as_str(), "a");
    let after = d.route("web", get().session("u")).await.unwrap().server;
    assert_eq!(after.as_str(), "a");
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline_keeps_guard_until_call_resolves() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Slow(Duration::from_secs(5)));
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a"]);

    let err = d
        .route("web", get().timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Timeout));
    assert_eq!(d.server_status("a").unwrap().active_connections, 1);

    time::sleep(Duration::from_secs(6)).await;
    let status = d.server_status("a").unwrap();
    assert_eq!(status.active_connections, 0);
    assert_eq!(status.circuit.failure_count, 1);
    assert_eq!(status.stats.errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_fails_over() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Slow(Duration::from_secs(5)));
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.failover.attempt_timeout_ms = 1_000;
    pool_with(&d, "web", rules, &["a", "b"]);

    let routed = d.route("web", get()).await.unwrap();
    assert_eq!(routed.server.as_str(), "b");
    assert_eq!(routed.failures[0].reason, FailureReason::Timeout);
}

#[tokio::test]
async fn test_maintenance_excludes_server() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a", "b"]);

    d.set_maintenance("a", true).unwrap();
    assert_eq!(d.server_status("a").unwrap().state, LifecycleState::Maintenance);
    for _ in 0..4 {
        assert_eq!(d.route("web", get()).await.unwrap().server.as_str(), "b");
    }

    d.set_maintenance("a", false).unwrap();
    let mut seen: Vec<String> = Vec::new();
    for _ in 0..2 {
        seen.push(d.route("web", get()).await.unwrap().server.to_string());
    }
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_window() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    let mut rules = settings();
    rules.rate_limit = RateLimitConfig {
        enabled: true,
        max_requests: 3,
        window_ms: 1_000,
        pool_max_requests: None,
    };
    pool_with(&d, "web", rules, &["a"]);

    for _ in 0..3 {
        d.route("web", get()).await.unwrap();
    }
    let err = d.route("web", get()).await.unwrap_err();
    assert!(matches!(err, RouteError::RateLimited { .. }));
    assert_eq!(upstream.count("a"), 3);

    time::advance(Duration::from_millis(1_001)).await;
    d.route("web", get()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_routes_admit_exactly_the_window_limit() {
    let upstream = ScriptedUpstream::new();
    let d = Arc::new(common::dispatcher(upstream.clone()));
    let mut rules = settings();
    rules.failover.max_retries = 1;
    rules.rate_limit = RateLimitConfig {
        enabled: true,
        max_requests: 5,
        window_ms: 60_000,
        pool_max_requests: None,
    };
    pool_with(&d, "web", rules, &["a"]);

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let d = d.clone();
        tasks.spawn(async move { d.route("web", get()).await });
    }

    let mut admitted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => assert!(matches!(err, RouteError::RateLimited { .. }), "unexpected {:?}", err),
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(upstream.count("a"), 5);
    let status = d.server_status("a").unwrap();
    assert_eq!(status.active_connections, 0);
    assert_eq!(status.rate_window, 5);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_server_excluded_until_history_recovers() {
    let upstream = ScriptedUpstream::new();
    let probe = StaticProbe::new();
    probe.fail("b");
    let d = Dispatcher::new(upstream.clone(), probe.clone());
    let mut rules = settings();
    rules.health_check.enabled = true;
    rules.health_check.interval_ms = 1_000;
    pool_with(&d, "web", rules, &["a", "b"]);

    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(d.server_status("a").unwrap().state, LifecycleState::Healthy);
    assert_eq!(d.server_status("b").unwrap().state, LifecycleState::Unhealthy);
    for _ in 0..4 {
        assert_eq!(d.route("web", get()).await.unwrap().server.as_str(), "a");
    }

    probe.recover("b");
    // Window [fail, ok, ok, ok]: 3 of 4 is still below 0.8.
    time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(d.server_status("b").unwrap().state, LifecycleState::Unhealthy);
    // Window [fail, ok, ok, ok, ok]: 4 of 5.
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(d.server_status("b").unwrap().state, LifecycleState::Healthy);
}

#[tokio::test]
async fn test_error_taxonomy() {
    let upstream = ScriptedUpstream::new();
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a"]);
    d.create_pool("empty", settings()).unwrap();

    assert!(matches!(
        d.route("missing", get()).await,
        Err(RouteError::Configuration(ConfigurationError::PoolNotFound(_)))
    ));
    assert!(matches!(
        d.route("empty", get()).await,
        Err(RouteError::NoServerAvailable { .. })
    ));
    assert_eq!(
        d.add_server("empty", &ServerSpec::new("a", "10.0.0.9", 80)).unwrap_err(),
        ConfigurationError::DuplicateServer(ServerId::new("a"))
    );
    assert!(matches!(
        d.set_maintenance("ghost", true),
        Err(ConfigurationError::ServerNotFound(_))
    ));
    let mut bad = settings();
    bad.health_check.healthy_threshold = 1.5;
    assert!(matches!(d.create_pool("bad", bad), Err(ConfigurationError::Invalid(_))));
}

#[tokio::test]
async fn test_downstream_4xx_is_not_a_failure() {
    let upstream = ScriptedUpstream::new();
    upstream.set("a", Behavior::Status(404));
    let d = common::dispatcher(upstream.clone());
    pool_with(&d, "web", settings(), &["a"]);

    let routed = d.route("web", get()).await.unwrap();
    assert_eq!(routed.response.status, 404);
    let status = d.server_status("a").unwrap();
    assert_eq!(status.circuit.failure_count, 0);
    assert_eq!(status.stats.errors, 0);
}
