//! Scripted realm used by unit tests

use crate::bridge::RealmPort;
use crate::error::{Result, SandboxError};
use crate::realm::{IsolatedRealm, RealmFactory};
use crate::sanitizer::SanitizedText;
use async_trait::async_trait;
use coderealm_common::{ExecutionEvent, SessionId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Emit(ExecutionEvent),
    Raw(String),
    Sleep(Duration),
    /// Never finish
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub injected: Mutex<Vec<String>>,
}

/// Factory whose realms replay a fixed list of steps after injection
pub(crate) struct ScriptedFactory {
    steps: Vec<Step>,
    failing_creates: AtomicUsize,
    pub counters: Arc<Counters>,
}

impl ScriptedFactory {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            failing_creates: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Make the next `n` calls to `create` fail
    pub fn failing_first(self, n: usize) -> Self {
        self.failing_creates.store(n, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealmFactory for ScriptedFactory {
    async fn create(&self, session_id: SessionId, port: RealmPort) -> Result<Box<dyn IsolatedRealm>> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            port.close();
            return Err(SandboxError::setup("scripted create failure"));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRealm {
            session_id,
            port,
            steps: self.steps.clone(),
            counters: self.counters.clone(),
            task: None,
            destroyed: false,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedRealm {
    session_id: SessionId,
    port: RealmPort,
    steps: Vec<Step>,
    counters: Arc<Counters>,
    task: Option<tokio::task::JoinHandle<()>>,
    destroyed: bool,
}

impl IsolatedRealm for ScriptedRealm {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn inject(&mut self, code: &SanitizedText, _timeout: Duration) -> Result<()> {
        self.counters
            .injected
            .lock()
            .unwrap()
            .push(code.as_str().to_string());
        let port = self.port.clone();
        let steps = self.steps.clone();
        self.task = Some(tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Emit(event) => {
                        port.post(&event);
                    }
                    Step::Raw(raw) => {
                        port.post_raw(raw);
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        }));
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.port.close();
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for ScriptedRealm {
    fn drop(&mut self) {
        self.destroy();
    }
}
