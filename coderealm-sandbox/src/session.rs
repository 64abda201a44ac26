//! One realm plus its bridge, owned by a single supervisor task

use crate::bridge::MessageBridge;
use crate::error::{Result, SandboxError};
use crate::limits::RealmLimits;
use crate::realm::{IsolatedRealm, RealmFactory};
use crate::sanitizer::SanitizedText;
use chrono::{DateTime, Utc};
use coderealm_common::{ExecutionEvent, SessionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Finished,
    Destroyed,
}

/// A live realm and the bridge it reports through.
///
/// Dropping the session destroys the realm.
pub struct SandboxSession {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: SessionState,
    realm: Box<dyn IsolatedRealm>,
    bridge: MessageBridge,
}

impl SandboxSession {
    /// Open a bridge and create a realm bound to it
    pub async fn open(
        factory: &dyn RealmFactory,
        id: SessionId,
        limits: &RealmLimits,
    ) -> Result<Self> {
        let (port, bridge) = MessageBridge::open(id, limits);
        let realm = factory.create(id, port).await?;
        tracing::debug!(session_id = %id, factory = factory.name(), "Session created");
        Ok(Self {
            id,
            created_at: Utc::now(),
            state: SessionState::Created,
            realm,
            bridge,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Hand sanitized code to the realm
    pub fn start(&mut self, code: &SanitizedText, timeout: Duration) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(SandboxError::setup(format!(
                "Session {} cannot start from {:?}",
                self.id, self.state
            )));
        }
        self.realm.inject(code, timeout)?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Next event from the realm; `None` once the bridge is finished or closed
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        let event = self.bridge.recv().await;
        match &event {
            Some(e) if e.is_terminal() => self.state = SessionState::Finished,
            None if self.state == SessionState::Running => self.state = SessionState::Finished,
            _ => {}
        }
        event
    }

    /// Tear down the realm. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        self.realm.destroy();
        self.state = SessionState::Destroyed;
        tracing::debug!(
            session_id = %self.id,
            dropped_messages = self.bridge.dropped(),
            "Session destroyed"
        );
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
