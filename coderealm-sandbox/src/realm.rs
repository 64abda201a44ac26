//! Realm abstraction and implementations

pub mod bootstrap;
#[cfg(feature = "v8")]
pub mod v8;

use crate::bridge::RealmPort;
use crate::sanitizer::SanitizedText;
use crate::Result;
use async_trait::async_trait;
use coderealm_common::SessionId;
use serde::Serialize;
use std::time::Duration;

pub use bootstrap::{BootstrapBuilder, Capability};
#[cfg(feature = "v8")]
pub use v8::V8RealmFactory;

/// Creates fresh realms, one per session
#[async_trait]
pub trait RealmFactory: Send + Sync {
    /// Build a realm bound to `port`. The realm is fully bootstrapped when
    /// this returns; any failure is a setup error.
    async fn create(&self, session_id: SessionId, port: RealmPort) -> Result<Box<dyn IsolatedRealm>>;

    /// Get factory name
    fn name(&self) -> &str;
}

/// A disposable execution environment.
///
/// Everything the realm reports goes through the [`RealmPort`] it was created
/// with: `output` events while running, then exactly one `error` or `done`.
pub trait IsolatedRealm: Send {
    fn session_id(&self) -> SessionId;

    /// Start running `code`. A watchdog posts a timeout `error` and
    /// terminates the realm if no terminal event is posted within `timeout`.
    fn inject(&mut self, code: &SanitizedText, timeout: Duration) -> Result<()>;

    /// Tear the realm down and close its port. Calling it again is a no-op.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Boundary hardening applied to realms and to any document a host serves
/// to embed one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundaryPolicy {
    pub headers: Vec<(&'static str, &'static str)>,
    /// Realms never resolve `import` specifiers
    pub module_loading: bool,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            headers: vec![
                (
                    "Content-Security-Policy",
                    "default-src 'none'; script-src 'unsafe-inline'",
                ),
                ("X-Content-Type-Options", "nosniff"),
                ("X-Frame-Options", "DENY"),
            ],
            module_loading: false,
        }
    }
}

impl BoundaryPolicy {
    pub fn header(&self, name: &str) -> Option<&'static str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }
}
