//! Execution supervisor - main entry point
//!
//! Runs one request at a time: rate limit, sanitize, create a realm, stream
//! its events into the live [`ExecutionOutcome`], and finalize exactly once.

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::rate_limit::RateLimiter;
use crate::realm::RealmFactory;
use crate::sanitizer::{SanitizedSource, SanitizedText, StaticSanitizer};
use crate::session::SandboxSession;
use crate::types::{ExecutionOutcome, ExecutionRequest};
use coderealm_common::{ExecutionEvent, OutcomeState, SessionId};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a session ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimited,
    Rejected,
    Runtime,
    Setup,
}

/// Supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Running { session_id: SessionId },
    Completed,
    Failed { reason: FailureReason },
    TimedOut,
}

impl SupervisorState {
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorState::Running { .. })
    }
}

struct Inner {
    config: SandboxConfig,
    limiter: RateLimiter,
    sanitizer: StaticSanitizer,
    factory: Arc<dyn RealmFactory>,
    outcome: watch::Sender<ExecutionOutcome>,
    state: Mutex<SupervisorState>,
}

/// Sandbox execution supervisor. Cheap to clone; clones share one state
/// machine.
#[derive(Clone)]
pub struct ExecutionSupervisor {
    inner: Arc<Inner>,
}

impl ExecutionSupervisor {
    /// Create a supervisor over `factory`, counting requests in the
    /// process-wide rate-limit store
    pub fn new(config: SandboxConfig, factory: Arc<dyn RealmFactory>) -> Self {
        Self::with_rate_limiter(config, factory, RateLimiter::new())
    }

    pub fn with_rate_limiter(
        config: SandboxConfig,
        factory: Arc<dyn RealmFactory>,
        limiter: RateLimiter,
    ) -> Self {
        let sanitizer = StaticSanitizer::new(config.execution.max_source_bytes);
        let (outcome, _) = watch::channel(ExecutionOutcome::idle());
        Self {
            inner: Arc::new(Inner {
                config,
                limiter,
                sanitizer,
                factory,
                outcome,
                state: Mutex::new(SupervisorState::Idle),
            }),
        }
    }

    /// Supervisor backed by V8 realms
    #[cfg(feature = "v8")]
    pub fn v8(config: SandboxConfig) -> Self {
        let factory = crate::realm::V8RealmFactory::new(config.realm.clone());
        Self::new(config, Arc::new(factory))
    }

    /// Submit a request.
    ///
    /// Returns as soon as the request is accepted for processing; progress
    /// and the result are published through [`subscribe`](Self::subscribe).
    /// The only error returned here is [`SandboxError::Busy`]; every other
    /// failure ends up in the outcome. Must be called within a tokio runtime.
    pub fn execute_code(&self, request: ExecutionRequest) -> Result<SessionId> {
        let session_id = SessionId::new();
        {
            let mut state = self.inner.lock_state();
            if let SupervisorState::Running { session_id: active } = *state {
                tracing::warn!(active = %active, caller_id = %request.caller_id, "Supervisor busy");
                return Err(SandboxError::Busy { active });
            }
            *state = SupervisorState::Running { session_id };
        }
        self.inner
            .outcome
            .send_replace(ExecutionOutcome::running(session_id));

        tracing::info!(
            session_id = %session_id,
            caller_id = %request.caller_id,
            language = %request.language_tag,
            code_len = request.source_text.len(),
            "Executing code"
        );

        let rate = &self.inner.config.rate_limit;
        let decision = self
            .inner
            .limiter
            .check(&request.caller_id, rate.max_requests, rate.window);
        if !decision.allowed {
            tracing::warn!(
                session_id = %session_id,
                caller_id = %request.caller_id,
                reset_time = %decision.reset_time,
                "Rate limited"
            );
            self.inner.finalize(
                session_id,
                SupervisorState::Failed {
                    reason: FailureReason::RateLimited,
                },
                Some(SandboxError::RateLimited {
                    reset_time: decision.reset_time,
                    limit: rate.max_requests,
                }),
            );
            return Ok(session_id);
        }

        let text = match self
            .inner
            .sanitizer
            .process(&request.source_text, &request.language())
        {
            SanitizedSource::Accepted(text) => text,
            SanitizedSource::Rejected(rejection) => {
                let error = rejection.into_error();
                tracing::warn!(session_id = %session_id, error = %error, "Request rejected");
                self.inner.finalize(
                    session_id,
                    SupervisorState::Failed {
                        reason: FailureReason::Rejected,
                    },
                    Some(error),
                );
                return Ok(session_id);
            }
        };

        let timeout = self.inner.config.effective_timeout(request.timeout_ms);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(session_id, text, timeout).await;
        });
        Ok(session_id)
    }

    /// Submit a request and wait for its terminal outcome
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        let mut rx = self.subscribe();
        let session_id = self.execute_code(request)?;
        let outcome = rx
            .wait_for(|o| o.session_id == Some(session_id) && o.is_done())
            .await
            .map_err(|_| SandboxError::setup("Supervisor outcome channel closed"))?;
        Ok(outcome.clone())
    }

    /// Live view of the current (or last) execution
    pub fn subscribe(&self) -> watch::Receiver<ExecutionOutcome> {
        self.inner.outcome.subscribe()
    }

    /// Snapshot of the current outcome
    pub fn outcome(&self) -> ExecutionOutcome {
        self.inner.outcome.borrow().clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.lock_state()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Get the realm factory name
    pub fn factory_name(&self) -> &str {
        self.inner.factory.name()
    }
}

impl std::fmt::Debug for ExecutionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSupervisor")
            .field("factory", &self.inner.factory.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn drive(self: Arc<Self>, session_id: SessionId, text: SanitizedText, timeout: Duration) {
        let mut guard = RunGuard {
            inner: self.clone(),
            session_id,
            armed: true,
        };
        let (state, error) = self.run_session(session_id, &text, timeout).await;
        guard.armed = false;
        self.finalize(session_id, state, error);
    }

    async fn run_session(
        &self,
        session_id: SessionId,
        text: &SanitizedText,
        timeout: Duration,
    ) -> (SupervisorState, Option<SandboxError>) {
        let setup_failed = |error: SandboxError| {
            tracing::warn!(session_id = %session_id, error = %error, "Session setup failed");
            (
                SupervisorState::Failed {
                    reason: FailureReason::Setup,
                },
                Some(error),
            )
        };

        let mut session =
            match SandboxSession::open(self.factory.as_ref(), session_id, &self.config.realm).await {
                Ok(session) => session,
                Err(e) => return setup_failed(e),
            };

        let deadline = Instant::now() + timeout;
        if let Err(e) = session.start(text, timeout) {
            session.destroy();
            return setup_failed(e);
        }

        let timeout_ms = timeout.as_millis() as u64;
        let timed_out = || {
            tracing::warn!(session_id = %session_id, timeout_ms, "Execution timed out");
            (
                SupervisorState::TimedOut,
                Some(SandboxError::Timeout { timeout_ms }),
            )
        };

        let result = loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => break timed_out(),
                event = session.next_event() => match event {
                    Some(ExecutionEvent::Output(chunk)) => self.append_output(session_id, &chunk),
                    Some(ExecutionEvent::Error(info)) => {
                        if Instant::now() >= deadline {
                            break timed_out();
                        }
                        break (
                            SupervisorState::Failed { reason: FailureReason::Runtime },
                            Some(SandboxError::Runtime { error: info }),
                        );
                    }
                    Some(ExecutionEvent::Done) => break (SupervisorState::Completed, None),
                    None => break setup_failed(SandboxError::setup(
                        "Realm closed without a terminal event",
                    )),
                },
            }
        };

        session.destroy();
        result
    }

    fn append_output(&self, session_id: SessionId, chunk: &str) {
        if self.config.execution.mirror_output_to_log {
            tracing::info!(session_id = %session_id, output = %chunk.trim_end(), "Realm output");
        }
        self.outcome.send_modify(|outcome| {
            if outcome.session_id == Some(session_id) {
                outcome.output.push_str(chunk);
            }
        });
    }

    /// Move `session_id` out of `Running`. Only the first call per session
    /// has any effect.
    fn finalize(
        &self,
        session_id: SessionId,
        next: SupervisorState,
        error: Option<SandboxError>,
    ) -> bool {
        let mut state = self.lock_state();
        match *state {
            SupervisorState::Running { session_id: active } if active == session_id => {}
            _ => return false,
        }
        *state = next;

        match &error {
            None => tracing::info!(session_id = %session_id, state = ?next, "Execution finished"),
            Some(e) => tracing::info!(
                session_id = %session_id,
                state = ?next,
                error_kind = e.kind(),
                "Execution finished with error"
            ),
        }

        self.outcome.send_modify(|outcome| {
            if outcome.session_id == Some(session_id) {
                outcome.error = error;
                outcome.state = OutcomeState::Done;
            }
        });
        true
    }
}

/// Finalizes the session if the driving task is dropped before it could
/// (task abort or runtime shutdown)
struct RunGuard {
    inner: Arc<Inner>,
    session_id: SessionId,
    armed: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finalize(
                self.session_id,
                SupervisorState::Failed {
                    reason: FailureReason::Setup,
                },
                Some(SandboxError::setup("Execution task was cancelled")),
            );
        }
    }
}
