//! V8 realm using deno_core.
//!
//! Every realm is a brand new `JsRuntime` on its own OS thread with a
//! current-thread tokio runtime; V8 isolates are `!Send`. The host talks to
//! the thread through a one-shot code channel, a cancellation token and the
//! isolate's thread-safe handle.

mod ops;

use super::bootstrap::BootstrapBuilder;
use super::{IsolatedRealm, RealmFactory};
use crate::bridge::RealmPort;
use crate::error::{Result, SandboxError};
use crate::limits::RealmLimits;
use crate::sanitizer::SanitizedText;
use async_trait::async_trait;
use coderealm_common::{ErrorInfo, ExecutionEvent, SessionId};
use deno_core::{v8, JsRuntime, NoopModuleLoader, PollEventLoopOptions, RuntimeOptions};
use regex::Regex;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const BOOTSTRAP_SCRIPT_NAME: &str = "<realm_bootstrap>";
const USER_SCRIPT_NAME: &str = "<user_code>";

/// State shared between the host handle, the realm thread, its ops and the
/// watchdog. Guarantees a single terminal event per realm.
pub(crate) struct RealmShared {
    port: RealmPort,
    finished: AtomicBool,
}

impl RealmShared {
    fn new(port: RealmPort) -> Self {
        Self {
            port,
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.port.session_id()
    }

    /// Post a non-terminal event unless the realm already finished
    pub(crate) fn post(&self, event: &ExecutionEvent) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        self.port.post(event)
    }

    /// Post the terminal event. Only the first caller succeeds.
    fn finish(&self, event: ExecutionEvent) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.port.post(&event)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// State for the near-heap-limit callback
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution when V8 approaches the heap ceiling, granting 1 MB
/// so the termination can propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the `HeapLimitState` boxed in `drive_realm`,
    // which is declared before the runtime and therefore dropped after it.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Factory for V8 realms
#[derive(Debug, Clone)]
pub struct V8RealmFactory {
    limits: RealmLimits,
    bootstrap: BootstrapBuilder,
}

impl V8RealmFactory {
    /// Factory with the default capability table
    pub fn new(limits: RealmLimits) -> Self {
        let bootstrap = BootstrapBuilder::new(&limits);
        Self { limits, bootstrap }
    }

    /// Factory with a custom capability table
    pub fn with_bootstrap(limits: RealmLimits, bootstrap: BootstrapBuilder) -> Self {
        Self { limits, bootstrap }
    }

    pub fn limits(&self) -> &RealmLimits {
        &self.limits
    }
}

impl Default for V8RealmFactory {
    fn default() -> Self {
        Self::new(RealmLimits::default())
    }
}

#[async_trait]
impl RealmFactory for V8RealmFactory {
    async fn create(&self, session_id: SessionId, port: RealmPort) -> Result<Box<dyn IsolatedRealm>> {
        let script = self.bootstrap.build()?;
        let shared = Arc::new(RealmShared::new(port));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (code_tx, code_rx) = oneshot::channel();

        let thread_shared = shared.clone();
        let thread_cancel = cancel.clone();
        let max_heap_bytes = self.limits.max_heap_bytes;
        std::thread::Builder::new()
            .name(format!("realm-{}", session_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build realm runtime: {}", e)));
                        return;
                    }
                };
                rt.block_on(drive_realm(
                    thread_shared,
                    script,
                    max_heap_bytes,
                    ready_tx,
                    code_rx,
                    thread_cancel,
                ));
            })
            .map_err(|e| SandboxError::setup(format!("Failed to spawn realm thread: {}", e)))?;

        let isolate = match ready_rx.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(reason)) => {
                shared.port.close();
                return Err(SandboxError::setup(reason));
            }
            Err(_) => {
                shared.port.close();
                return Err(SandboxError::setup("Realm thread exited during bootstrap"));
            }
        };

        tracing::debug!(session_id = %session_id, "V8 realm ready");
        Ok(Box::new(V8Realm {
            session_id,
            shared,
            isolate,
            cancel,
            code_tx: Some(code_tx),
            watchdog: None,
            destroyed: false,
        }))
    }

    fn name(&self) -> &str {
        "v8"
    }
}

type ReadySender = oneshot::Sender<std::result::Result<v8::IsolateHandle, String>>;

/// Body of the realm thread: bootstrap, wait for code, run it to completion
async fn drive_realm(
    shared: Arc<RealmShared>,
    bootstrap: String,
    max_heap_bytes: usize,
    ready_tx: ReadySender,
    code_rx: oneshot::Receiver<String>,
    cancel: CancellationToken,
) {
    // Declared before the runtime so it outlives it.
    let heap_state: Box<HeapLimitState>;

    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_bytes);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ops::realm_extension()],
        create_params: Some(create_params),
        module_loader: Some(Rc::new(NoopModuleLoader)),
        ..Default::default()
    });

    heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );
    runtime.op_state().borrow_mut().put(shared.clone());

    if let Err(e) = runtime.execute_script(BOOTSTRAP_SCRIPT_NAME, bootstrap) {
        let _ = ready_tx.send(Err(format!("Realm bootstrap failed: {}", e)));
        return;
    }
    let handle = runtime.v8_isolate().thread_safe_handle();
    if ready_tx.send(Ok(handle)).is_err() {
        return;
    }

    let code = tokio::select! {
        code = code_rx => match code {
            Ok(code) => code,
            Err(_) => return,
        },
        _ = cancel.cancelled() => return,
    };

    let session_id = shared.session_id();
    tracing::debug!(session_id = %session_id, code_len = code.len(), "Running user code");

    let result = match runtime.execute_script(USER_SCRIPT_NAME, code) {
        Ok(_) => {
            tokio::select! {
                result = runtime.run_event_loop(PollEventLoopOptions::default()) => {
                    result.map_err(|e| e.to_string())
                }
                _ = cancel.cancelled() => return,
            }
        }
        Err(e) => Err(e.to_string()),
    };

    let event = if heap_state.triggered.load(Ordering::SeqCst) {
        ExecutionEvent::Error(ErrorInfo::new("Heap limit exceeded"))
    } else {
        match result {
            Ok(()) => ExecutionEvent::Done,
            Err(message) => ExecutionEvent::Error(error_info_from(&message)),
        }
    };
    if !shared.is_finished() {
        shared.finish(event);
    }
}

/// Turn a deno_core error rendering into a wire error payload
fn error_info_from(rendered: &str) -> ErrorInfo {
    static POSITION: OnceLock<Regex> = OnceLock::new();
    let position = POSITION.get_or_init(|| {
        Regex::new(r"<user_code>:(\d+):(\d+)").expect("position pattern must compile")
    });

    let first_line = rendered.lines().next().unwrap_or(rendered).trim();
    let message = first_line
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| first_line.strip_prefix("Uncaught "))
        .unwrap_or(first_line);
    let info = ErrorInfo::new(if message.is_empty() { "Unknown error" } else { message });

    match position.captures(rendered) {
        Some(caps) => match (caps[1].parse(), caps[2].parse()) {
            (Ok(line), Ok(column)) => info.with_position(line, column),
            _ => info,
        },
        None => info,
    }
}

/// Host handle to one V8 realm
pub struct V8Realm {
    session_id: SessionId,
    shared: Arc<RealmShared>,
    isolate: v8::IsolateHandle,
    cancel: CancellationToken,
    code_tx: Option<oneshot::Sender<String>>,
    watchdog: Option<std::sync::mpsc::Sender<()>>,
    destroyed: bool,
}

impl IsolatedRealm for V8Realm {
    fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn inject(&mut self, code: &SanitizedText, timeout: Duration) -> Result<()> {
        if self.destroyed {
            return Err(SandboxError::setup("Realm already destroyed"));
        }
        let code_tx = self
            .code_tx
            .take()
            .ok_or_else(|| SandboxError::setup("Realm already received code"))?;
        code_tx
            .send(code.as_str().to_string())
            .map_err(|_| SandboxError::setup("Realm thread is gone"))?;

        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let shared = self.shared.clone();
        let isolate = self.isolate.clone();
        let session_id = self.session_id;
        std::thread::Builder::new()
            .name(format!("realm-watchdog-{}", session_id))
            .spawn(move || {
                if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
                    cancel_rx.recv_timeout(timeout)
                {
                    let timeout_ms = timeout.as_millis() as u64;
                    let info = ErrorInfo::new(format!("Execution timed out after {} ms", timeout_ms));
                    if shared.finish(ExecutionEvent::Error(info)) {
                        tracing::warn!(session_id = %session_id, timeout_ms, "Realm watchdog fired");
                        isolate.terminate_execution();
                    }
                }
            })
            .map_err(|e| SandboxError::setup(format!("Failed to spawn watchdog: {}", e)))?;
        self.watchdog = Some(cancel_tx);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.shared.finished.store(true, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.send(());
        }
        self.code_tx = None;
        self.cancel.cancel();
        self.isolate.terminate_execution();
        self.shared.port.close();
        tracing::debug!(session_id = %self.session_id, "V8 realm destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for V8Realm {
    fn drop(&mut self) {
        self.destroy();
    }
}
