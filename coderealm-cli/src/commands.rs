//! CLI command implementations
//!
//! Thin wrappers over `coderealm-sandbox`; everything that decides what runs
//! lives in the library.

use anyhow::{Context, Result};
use coderealm_sandbox::{
    BootstrapBuilder, BoundaryPolicy, Capability, ExecutionOutcome, ExecutionRequest,
    ExecutionSupervisor, Language, SandboxConfig, SanitizedSource, StaticSanitizer,
};
use std::path::Path;
use tracing::{debug, info};

/// Load configuration from `path`, or from the default location
pub fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let config = SandboxConfig::load(path).context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");
    Ok(config)
}

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))
}

/// Execute a script through the supervisor and print its outcome
///
/// # Arguments
/// * `config` - Sandbox configuration
/// * `file` - Script to execute
/// * `language` - Language tag sent with the request
/// * `timeout_ms` - Requested timeout; `None` uses the configured default
/// * `caller` - Caller identity for rate limiting
/// * `json` - Print the whole outcome as JSON instead of plain text
///
/// Returns `false` when the execution ended with an error.
pub async fn execute_run(
    config: SandboxConfig,
    file: &Path,
    language: String,
    timeout_ms: Option<u64>,
    caller: String,
    json: bool,
) -> Result<bool> {
    let source = read_source(file).await?;

    let mut request = ExecutionRequest::new(source)
        .with_language(language)
        .with_caller(caller);
    if let Some(ms) = timeout_ms {
        request = request.with_timeout_ms(ms);
    }

    let supervisor = ExecutionSupervisor::v8(config);
    info!(
        file = %file.display(),
        factory = supervisor.factory_name(),
        "Running script"
    );

    let outcome = supervisor
        .execute(request)
        .await
        .context("Execution could not be started")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(outcome.success())
}

fn print_outcome(outcome: &ExecutionOutcome) {
    print!("{}", outcome.output);
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        println!();
    }
    if let Some(error) = &outcome.error {
        eprintln!("✗ {} ({})", error, error.kind());
    }
}

/// Run the sanitizer over a script without executing it
///
/// Returns `false` when the script would be rejected.
pub async fn execute_check(config: &SandboxConfig, file: &Path, language: &str) -> Result<bool> {
    let source = read_source(file).await?;
    let sanitizer = StaticSanitizer::new(config.execution.max_source_bytes);

    let language = match language.parse::<Language>() {
        Ok(language) => language,
        Err(never) => match never {},
    };

    match sanitizer.process(&source, &language) {
        SanitizedSource::Accepted(text) => {
            println!("✓ Accepted ({} bytes)", text.len());
            for rewrite in text.rewrites() {
                println!("  rewrite {} x{}", rewrite.rule, rewrite.count);
            }
            if text.was_rewritten() {
                println!();
                println!("{}", text.as_str());
            }
            Ok(true)
        }
        SanitizedSource::Rejected(rejection) => {
            println!("✗ Rejected: {}", rejection.into_error());
            Ok(false)
        }
    }
}

/// Print the capability table applied to every realm and the boundary headers
pub fn execute_policy(config: &SandboxConfig) -> Result<()> {
    let bootstrap = BootstrapBuilder::new(&config.realm);
    let policy = BoundaryPolicy::default();

    println!("Capabilities:");
    for (name, capability) in bootstrap.capabilities() {
        let action = match capability {
            Capability::Remove => "removed",
            Capability::Block => "blocked",
        };
        println!("  {:<20} {}", name, action);
    }

    println!();
    println!("Realm limits:");
    println!("  max_heap_bytes        {}", config.realm.max_heap_bytes);
    println!("  max_timer_delay_ms    {}", config.realm.max_timer_delay_ms());
    println!("  max_output_bytes      {}", config.realm.max_output_bytes);
    println!("  max_output_call_chars {}", config.realm.max_output_call_chars);

    println!();
    println!("Boundary headers:");
    for (name, value) in &policy.headers {
        println!("  {}: {}", name, value);
    }
    println!(
        "  module loading: {}",
        if policy.module_loading { "enabled" } else { "disabled" }
    );
    Ok(())
}
