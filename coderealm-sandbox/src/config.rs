//! Configuration for the execution supervisor

use crate::error::{Result, SandboxError};
use crate::limits::RealmLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level sandbox configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub realm: RealmLimits,
}

/// Per-request execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout used when a request does not carry one
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Upper bound for any requested timeout
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    /// Largest accepted source text in bytes
    pub max_source_bytes: usize,
    /// Also log every realm output line through `tracing`
    pub mirror_output_to_log: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(5_000),
            max_timeout: Duration::from_millis(10_000),
            max_source_bytes: 64 * 1024, // 64 KB
            mirror_output_to_log: false,
        }
    }
}

/// Sliding-window rate limit per caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_millis(60_000),
        }
    }
}

impl SandboxConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(SandboxError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            SandboxError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded sandbox config");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SandboxConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::config(format!("Failed to create config directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SandboxError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| SandboxError::config(format!("Failed to write config: {}", e)))
    }

    /// `~/.config/coderealm/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("coderealm").join("config.toml"))
    }

    /// Reject settings that cannot produce a working supervisor
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        if exec.max_timeout.is_zero() {
            return Err(SandboxError::config("execution.max_timeout must be positive"));
        }
        if exec.default_timeout.is_zero() || exec.default_timeout > exec.max_timeout {
            return Err(SandboxError::config(
                "execution.default_timeout must be within (0, max_timeout]",
            ));
        }
        if exec.max_source_bytes == 0 {
            return Err(SandboxError::config("execution.max_source_bytes must be positive"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(SandboxError::config("rate_limit.max_requests must be positive"));
        }
        if self.rate_limit.window.is_zero() {
            return Err(SandboxError::config("rate_limit.window must be positive"));
        }
        if self.realm.max_heap_bytes < 4 * 1024 * 1024 {
            return Err(SandboxError::config("realm.max_heap_bytes must be at least 4 MB"));
        }
        if self.realm.max_output_call_chars == 0 {
            return Err(SandboxError::config("realm.max_output_call_chars must be positive"));
        }
        Ok(())
    }

    /// Effective timeout for a request: default when absent, clamped to
    /// `[1 ms, max_timeout]` otherwise
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let max_ms = self.execution.max_timeout.as_millis().max(1) as u64;
        match requested_ms {
            None => self.execution.default_timeout.min(self.execution.max_timeout),
            Some(ms) => Duration::from_millis(ms.clamp(1, max_ms)),
        }
    }
}
