//! coderealm sandbox - run untrusted JavaScript behind an isolation boundary
//!
//! Submissions pass a per-caller rate limiter and a static sanitizer, then run
//! in a disposable realm that reports back over a typed message bridge. The
//! [`ExecutionSupervisor`] drives one execution at a time and publishes a
//! live [`ExecutionOutcome`].

mod bridge;
mod config;
mod error;
mod limits;
mod rate_limit;
pub mod realm;
mod sanitizer;
mod session;
mod supervisor;
#[cfg(test)]
mod testing;
mod types;

pub use bridge::{Envelope, MessageBridge, RealmPort, OUTPUT_TRUNCATED_MARKER};
pub use config::{ExecutionConfig, RateLimitConfig, SandboxConfig};
pub use error::{Result, SandboxError};
pub use limits::RealmLimits;
pub use rate_limit::{InMemoryRateLimiterStore, RateLimitDecision, RateLimiter, RateLimiterStore};
#[cfg(feature = "v8")]
pub use realm::V8RealmFactory;
pub use realm::{BootstrapBuilder, BoundaryPolicy, Capability, IsolatedRealm, RealmFactory};
pub use sanitizer::{
    AppliedRewrite, BlockedCategory, Rejection, SanitizedSource, SanitizedText, StaticSanitizer,
};
pub use session::{SandboxSession, SessionState};
pub use supervisor::{ExecutionSupervisor, FailureReason, SupervisorState};
pub use types::{ExecutionOutcome, ExecutionRequest, ANONYMOUS_CALLER};

/// Re-export shared wire and identifier types
pub use coderealm_common::{ErrorInfo, ExecutionEvent, Language, OutcomeState, SessionId};
