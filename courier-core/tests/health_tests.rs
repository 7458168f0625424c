//! Relay health tracking and frame parsing at the crate boundary.

use std::sync::Arc;

use chrono::Duration;
use courier_core::clock::ManualClock;
use courier_core::config::{BackoffConfig, CircuitBreakerConfig, HealthConfig};
use courier_core::health::{CircuitState, HealthMonitor, HealthStatus};
use courier_core::relay::{ClientMessage, FrameError, RelayMessage};

const RELAY: &str = "wss://relay.test";

fn monitor(clock: &Arc<ManualClock>) -> HealthMonitor {
    let config = HealthConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_ms: 30_000,
            half_open_max_attempts: 2,
        },
        backoff: BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..HealthConfig::default()
    };
    let health = HealthMonitor::with_clock(config, clock.clone());
    health.initialize_relay(RELAY);
    health
}

#[test]
fn circuit_opens_after_threshold_and_cools_down() {
    let clock = Arc::new(ManualClock::new());
    let health = monitor(&clock);

    for _ in 0..2 {
        health.record_connection_failure(RELAY, Some("refused"));
        assert!(health.can_connect(RELAY));
    }
    let metrics = health
        .record_connection_failure(RELAY, Some("refused"))
        .unwrap();
    assert_eq!(metrics.circuit_breaker_state, CircuitState::Open);
    assert_eq!(metrics.consecutive_failures, 3);
    assert_eq!(metrics.failed_connections, 3);
    assert_eq!(metrics.status, HealthStatus::Unhealthy);
    assert!(!health.can_connect(RELAY));

    clock.advance(Duration::seconds(29));
    assert!(!health.can_connect(RELAY));

    clock.advance(Duration::seconds(1));
    assert!(health.can_connect(RELAY));
    assert_eq!(
        health.get_metrics(RELAY).unwrap().circuit_breaker_state,
        CircuitState::HalfOpen
    );
}

#[test]
fn half_open_failure_reopens_and_successes_close() {
    let clock = Arc::new(ManualClock::new());
    let health = monitor(&clock);
    for _ in 0..3 {
        health.record_connection_failure(RELAY, None);
    }
    clock.advance(Duration::seconds(30));
    assert!(health.can_connect(RELAY));

    health.record_connection_failure(RELAY, Some("still down"));
    assert_eq!(
        health.get_metrics(RELAY).unwrap().circuit_breaker_state,
        CircuitState::Open
    );
    assert!(!health.can_connect(RELAY));

    clock.advance(Duration::seconds(30));
    assert!(health.can_connect(RELAY));
    health.record_connection_success(RELAY);
    assert_eq!(
        health.get_metrics(RELAY).unwrap().circuit_breaker_state,
        CircuitState::HalfOpen
    );
    health.record_connection_success(RELAY);
    let metrics = health.get_metrics(RELAY).unwrap();
    assert_eq!(metrics.circuit_breaker_state, CircuitState::Closed);
    assert_eq!(metrics.consecutive_failures, 0);
}

#[test]
fn backoff_grows_to_the_cap_and_resets_on_success() {
    let clock = Arc::new(ManualClock::new());
    let health = monitor(&clock);

    let delays: Vec<u64> = (0..6)
        .map(|_| {
            health
                .record_connection_failure(RELAY, None)
                .unwrap()
                .backoff_delay_ms
        })
        .collect();
    assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));

    clock.advance(Duration::seconds(30));
    assert!(health.can_connect(RELAY));
    health.record_connection_success(RELAY);

    let metrics = health.get_metrics(RELAY).unwrap();
    assert_eq!(metrics.retry_count, 0);
    assert_eq!(metrics.backoff_delay_ms, 1_000);
    assert!(metrics.next_retry_at.is_none());
    assert_eq!(
        health
            .record_connection_failure(RELAY, None)
            .unwrap()
            .backoff_delay_ms,
        1_000
    );
}

#[test]
fn publish_outcomes_are_counted_separately() {
    let clock = Arc::new(ManualClock::new());
    let health = monitor(&clock);
    health.record_connection_success(RELAY);
    health.record_publish_success(RELAY);
    health.record_publish_success(RELAY);
    health.record_publish_failure(RELAY, Some("queue full"));

    let metrics = health.get_metrics(RELAY).unwrap();
    assert_eq!(metrics.publish_successes, 2);
    assert_eq!(metrics.publish_failures, 1);
    assert_eq!(metrics.last_error.as_deref(), Some("queue full"));
    assert_eq!(metrics.circuit_breaker_state, CircuitState::Closed);
}

#[test]
fn forgotten_relays_stay_forgotten() {
    let clock = Arc::new(ManualClock::new());
    let health = monitor(&clock);
    health.record_connection_success(RELAY);
    health.remove_relay(RELAY);

    health.record_publish_success(RELAY);
    health.record_connection_failure(RELAY, Some("late close"));
    assert!(!health.can_connect(RELAY));
    assert!(health.get_metrics(RELAY).is_none());
    assert_eq!(health.get_health_status(RELAY), HealthStatus::Unknown);

    health.initialize_relay(RELAY);
    let metrics = health.get_metrics(RELAY).unwrap();
    assert_eq!(metrics.publish_successes, 0);
    assert_eq!(metrics.failed_connections, 0);
}

#[test]
fn malformed_relay_frames_are_rejected() {
    let cases = [
        "",
        "not json",
        "{}",
        "[]",
        "[1, 2]",
        r#"["WHAT", "x"]"#,
        r#"["NOTICE"]"#,
        r#"["NOTICE", 5]"#,
        r#"["EOSE", "a", "b"]"#,
        r#"["OK", "abc", true, ""]"#,
        r#"["OK", "0000000000000000000000000000000000000000000000000000000000000000", "yes", ""]"#,
        r#"["EVENT", "sub", {"id": "nope"}]"#,
    ];
    for text in cases {
        assert!(
            RelayMessage::from_json(text).is_err(),
            "accepted malformed frame {text:?}"
        );
    }
    assert!(matches!(
        RelayMessage::from_json(r#"{"NOTICE": "x"}"#),
        Err(FrameError::NotAnArray)
    ));
}

#[test]
fn well_formed_relay_frames_parse() {
    let id = "ab".repeat(32);
    let ok = RelayMessage::from_json(&format!(r#"["OK", "{id}", false, "blocked: spam"]"#)).unwrap();
    assert_eq!(
        ok,
        RelayMessage::Ok {
            event_id: id,
            accepted: false,
            message: "blocked: spam".to_string(),
        }
    );
    assert_eq!(
        RelayMessage::from_json(r#"["EOSE", "sync-1"]"#).unwrap(),
        RelayMessage::Eose("sync-1".to_string())
    );
}

#[test]
fn client_frames_reject_unknown_types() {
    assert!(ClientMessage::from_json(r#"["AUTH", "challenge"]"#).is_err());
    assert_eq!(
        ClientMessage::from_json(r#"["CLOSE", "inbox"]"#).unwrap(),
        ClientMessage::Close("inbox".to_string())
    );
}
