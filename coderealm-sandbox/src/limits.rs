//! Resource limits applied inside each realm

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-realm resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmLimits {
    /// V8 heap ceiling in bytes; the isolate is terminated when it is near
    pub max_heap_bytes: usize,

    /// Upper clamp applied to every `setTimeout` delay
    #[serde(with = "humantime_serde")]
    pub max_timer_delay: Duration,

    /// Total bytes of `output` accepted from one realm
    pub max_output_bytes: usize,

    /// Characters kept from a single print call
    pub max_output_call_chars: usize,

    /// Escape `&`, `<` and `>` in printed text
    pub escape_markup: bool,
}

impl Default for RealmLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: 64 * 1024 * 1024,            // 64 MB
            max_timer_delay: Duration::from_secs(2),      // 2 seconds
            max_output_bytes: 1024 * 1024,                // 1 MB
            max_output_call_chars: 10_000,
            escape_markup: true,
        }
    }
}

impl RealmLimits {
    /// Tight limits for anonymous callers
    pub fn strict() -> Self {
        Self {
            max_heap_bytes: 32 * 1024 * 1024,             // 32 MB
            max_timer_delay: Duration::from_millis(500),
            max_output_bytes: 64 * 1024,                  // 64 KB
            max_output_call_chars: 2_000,
            escape_markup: true,
        }
    }

    /// Loose limits for trusted or local use
    pub fn permissive() -> Self {
        Self {
            max_heap_bytes: 256 * 1024 * 1024,            // 256 MB
            max_timer_delay: Duration::from_secs(5),
            max_output_bytes: 8 * 1024 * 1024,            // 8 MB
            max_output_call_chars: 100_000,
            escape_markup: true,
        }
    }

    /// Timer clamp in whole milliseconds, as handed to the realm bootstrap
    pub fn max_timer_delay_ms(&self) -> u64 {
        self.max_timer_delay.as_millis().min(u128::from(u32::MAX)) as u64
    }
}
