//! Configuration files driving a supervisor

use assert_matches::assert_matches;
use coderealm_sandbox::{ExecutionRequest, SandboxConfig, SandboxError};
use coderealm_tests::{isolated_supervisor, EchoFactory};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_rate_limit_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[rate_limit]
max_requests = 2
window = "1m"
"#,
    )
    .unwrap();

    let config = SandboxConfig::load(Some(path.as_path())).unwrap();
    assert_eq!(config.rate_limit.max_requests, 2);
    assert_eq!(config.rate_limit.window, Duration::from_secs(60));

    let supervisor = isolated_supervisor(config, Arc::new(EchoFactory));
    for _ in 0..2 {
        let outcome = supervisor
            .execute(ExecutionRequest::new("console.log(1)").with_caller("config-test"))
            .await
            .unwrap();
        assert!(outcome.success());
    }

    let outcome = supervisor
        .execute(ExecutionRequest::new("console.log(1)").with_caller("config-test"))
        .await
        .unwrap();
    assert_matches!(outcome.error, Some(SandboxError::RateLimited { limit: 2, .. }));

    // Budgets are per caller
    let outcome = supervisor
        .execute(ExecutionRequest::new("console.log(1)").with_caller("someone-else"))
        .await
        .unwrap();
    assert!(outcome.success());
}

#[tokio::test]
async fn test_saved_config_round_trips_through_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = SandboxConfig::default();
    config.execution.default_timeout = Duration::from_millis(750);
    config.execution.mirror_output_to_log = true;
    config.save(&path).unwrap();

    let loaded = SandboxConfig::load(Some(path.as_path())).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.effective_timeout(None), Duration::from_millis(750));
}

#[test]
fn test_inconsistent_timeouts_are_rejected() {
    let result = SandboxConfig::from_toml_str(
        r#"
[execution]
default_timeout = "30s"
max_timeout = "10s"
"#,
    );
    assert_matches!(result, Err(SandboxError::Config { .. }));
}
