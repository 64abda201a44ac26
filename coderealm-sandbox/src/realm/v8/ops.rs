//! Host ops reachable from the realm bootstrap.
//!
//! User code never sees these directly: the bootstrap captures
//! `Deno.core.ops` in a closure and deletes `Deno` before user code runs.

use super::RealmShared;
use coderealm_common::ExecutionEvent;
use deno_core::{op2, Extension, OpState};
use std::sync::Arc;
use std::time::Duration;

/// Forward one console call. Only `output` events are accepted here; the
/// realm driver owns the terminal events.
#[op2(fast)]
fn op_realm_emit(state: &mut OpState, #[string] message: String) {
    let shared = state.borrow::<Arc<RealmShared>>();
    match ExecutionEvent::from_wire(&message) {
        Some(event @ ExecutionEvent::Output(_)) => {
            shared.post(&event);
        }
        Some(other) => {
            tracing::debug!(
                session_id = %shared.session_id(),
                event = ?other,
                "Ignoring non-output event from console shim"
            );
        }
        None => {}
    }
}

/// Timer backing for the `setTimeout` shim. The delay is already clamped.
#[op2(async)]
async fn op_realm_sleep(delay_ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
}

/// Create the realm extension
pub fn realm_extension() -> Extension {
    let ops = vec![op_realm_emit(), op_realm_sleep()];

    Extension {
        name: "coderealm",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}
