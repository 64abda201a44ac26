//! Supervisor pipeline through the public API, with a realm that echoes
//! whatever text reaches it

use assert_matches::assert_matches;
use coderealm_sandbox::{
    BlockedCategory, ExecutionRequest, FailureReason, OutcomeState, SandboxConfig, SandboxError,
    SupervisorState,
};
use coderealm_tests::{isolated_supervisor, setup_test_logging, CountingFactory, EchoFactory};
use std::sync::Arc;

#[tokio::test]
async fn test_realm_receives_rewritten_source() {
    setup_test_logging();
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(EchoFactory));

    let outcome = supervisor
        .execute(ExecutionRequest::new(
            "<script>steal()</script>console.log('x'); // javascript:alert(1)",
        ))
        .await
        .unwrap();

    assert!(outcome.success());
    assert!(!outcome.output.contains("<script"));
    assert!(!outcome.output.contains("steal()"));
    assert!(outcome.output.contains("blocked:alert(1)"));
    assert_eq!(supervisor.state(), SupervisorState::Completed);
}

#[tokio::test]
async fn test_blocked_source_never_creates_realm() {
    let factory = CountingFactory::new(EchoFactory);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(factory));

    let outcome = supervisor
        .execute(ExecutionRequest::new("localStorage.setItem('k', 'v')"))
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(SandboxError::BlockedPattern {
            category: BlockedCategory::Storage,
            ..
        })
    );
    assert_eq!(outcome.state, OutcomeState::Done);
    assert_eq!(counts.created(), 0);
    assert_eq!(
        supervisor.state(),
        SupervisorState::Failed {
            reason: FailureReason::Rejected
        }
    );
}

#[tokio::test]
async fn test_eval_is_rewritten_then_rejected() {
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(EchoFactory));

    let outcome = supervisor
        .execute(ExecutionRequest::new("const x = eval('1 + 1');"))
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(SandboxError::BlockedPattern {
            category: BlockedCategory::DynamicEvaluation,
            ..
        })
    );
}

#[tokio::test]
async fn test_other_language_is_reported_not_run() {
    let factory = CountingFactory::new(EchoFactory);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(factory));

    let outcome = supervisor
        .execute(ExecutionRequest::new("print('hi')").with_language("python"))
        .await
        .unwrap();

    assert_matches!(
        outcome.error,
        Some(SandboxError::UnsupportedLanguage { ref language }) if language == "python"
    );
    assert_eq!(counts.created(), 0);
}

#[tokio::test]
async fn test_oversized_source_is_invalid() {
    let mut config = SandboxConfig::default();
    config.execution.max_source_bytes = 16;
    let supervisor = isolated_supervisor(config, Arc::new(EchoFactory));

    let outcome = supervisor
        .execute(ExecutionRequest::new("console.log('this is too long');"))
        .await
        .unwrap();

    assert_matches!(outcome.error, Some(SandboxError::Validation { .. }));
}

#[tokio::test]
async fn test_subscriber_sees_running_then_done() {
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(EchoFactory));
    let mut rx = supervisor.subscribe();
    assert_eq!(rx.borrow().state, OutcomeState::Idle);

    let session_id = supervisor
        .execute_code(ExecutionRequest::new("console.log(1)"))
        .unwrap();

    let done = rx
        .wait_for(|o| o.session_id == Some(session_id) && o.is_done())
        .await
        .unwrap()
        .clone();
    assert!(done.success());
    assert_eq!(done.output, "console.log(1)");
}

#[tokio::test]
async fn test_outcome_serializes_for_callers() {
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(EchoFactory));
    let outcome = supervisor
        .execute(ExecutionRequest::new("fetch('https://example.com')"))
        .await
        .unwrap();

    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["state"], "done");
    assert_eq!(json["error"]["kind"], "blocked_pattern");
    assert_eq!(json["error"]["category"], "network");
}

#[tokio::test]
async fn test_supervisor_is_reusable_across_requests() {
    let factory = CountingFactory::new(EchoFactory);
    let counts = factory.counts();
    let supervisor = isolated_supervisor(SandboxConfig::default(), Arc::new(factory));

    for i in 0..3 {
        let outcome = supervisor
            .execute(ExecutionRequest::new(format!("console.log({})", i)))
            .await
            .unwrap();
        assert!(outcome.success());
    }
    assert_eq!(counts.created(), 3);
    assert_eq!(counts.destroyed(), 3);
}
