//! Realm bootstrap script.
//!
//! The script body is fixed. Everything that varies (the capability table
//! and the limits) is serialized to JSON and passed in as a single argument,
//! so no caller-controlled text is ever spliced into code.

use crate::error::{Result, SandboxError};
use crate::limits::RealmLimits;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Host capabilities that must not exist inside a realm
pub const DEFAULT_REMOVED: &[&str] = &[
    "Deno",
    "__bootstrap",
    "WebAssembly",
    "SharedArrayBuffer",
    "Atomics",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
    "EventSource",
    "localStorage",
    "sessionStorage",
    "indexedDB",
    "caches",
    "document",
    "window",
    "parent",
    "location",
    "navigator",
    "importScripts",
    "postMessage",
    "Worker",
    "require",
    "process",
];

/// Globals replaced by a function that throws `BlockedOperationError`
pub const DEFAULT_BLOCKED: &[&str] = &["eval", "Function", "setInterval", "clearInterval"];

const CONFIG_PLACEHOLDER: &str = "__REALM_CONFIG__";

const TEMPLATE: &str = r#"
((ops, config) => {
  "use strict";

  const emit = (event) => ops.op_realm_emit(JSON.stringify(event));
  const sleep = (ms) => ops.op_realm_sleep(ms);

  class BlockedOperationError extends Error {
    constructor(operation) {
      super(`${operation} is not allowed in the sandbox`);
      this.name = "BlockedOperationError";
    }
  }
  const blocker = (operation) => function () {
    throw new BlockedOperationError(operation);
  };

  // console
  const escapeMarkup = (text) =>
    text.replace(/&/g, "&amp;").replace(/</g, "&lt;").replace(/>/g, "&gt;");
  const serialize = (value) => {
    try {
      switch (typeof value) {
        case "string":
          return value;
        case "undefined":
          return "undefined";
        case "function":
          return value.name ? `[Function: ${value.name}]` : "[Function]";
        case "bigint":
        case "symbol":
          return value.toString();
        default:
          break;
      }
      if (value instanceof Error) {
        return `${value.name}: ${value.message}`;
      }
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return "[Unserializable]";
    }
  };
  const print = (...args) => {
    let text = args.map(serialize).join(" ");
    if (text.length > config.maxCallChars) {
      text = text.slice(0, config.maxCallChars) + "...";
    }
    if (config.escapeMarkup) {
      text = escapeMarkup(text);
    }
    emit({ type: "output", data: text + "\n" });
  };
  const consoleShim = Object.freeze({
    log: print,
    info: print,
    warn: print,
    error: print,
    debug: print,
    trace: print,
  });
  Object.defineProperty(globalThis, "console", {
    value: consoleShim,
    writable: false,
    configurable: false,
    enumerable: false,
  });

  // timers
  const timers = new Set();
  let nextTimerId = 1;
  const setTimeoutShim = (callback, delay = 0, ...args) => {
    if (typeof callback !== "function") {
      throw new BlockedOperationError("setTimeout with string code");
    }
    let ms = Math.floor(Number(delay));
    if (!Number.isFinite(ms) || ms < 0) {
      ms = 0;
    }
    ms = Math.min(ms, config.maxTimerDelayMs);
    const id = nextTimerId++;
    timers.add(id);
    sleep(ms).then(() => {
      if (timers.delete(id)) {
        callback(...args);
      }
    });
    return id;
  };
  const clearTimeoutShim = (id) => {
    timers.delete(id);
  };
  for (const [name, value] of [["setTimeout", setTimeoutShim], ["clearTimeout", clearTimeoutShim]]) {
    Object.defineProperty(globalThis, name, {
      value,
      writable: false,
      configurable: false,
      enumerable: false,
    });
  }

  // function constructors reachable through prototypes
  const constructors = {
    Function: Function,
    AsyncFunction: (async function () {}).constructor,
    GeneratorFunction: (function* () {}).constructor,
    AsyncGeneratorFunction: (async function* () {}).constructor,
  };
  for (const [name, ctor] of Object.entries(constructors)) {
    Object.defineProperty(ctor.prototype, "constructor", {
      value: blocker(name),
      writable: false,
      configurable: false,
    });
  }

  for (const name of config.block) {
    Object.defineProperty(globalThis, name, {
      value: blocker(name),
      writable: false,
      configurable: false,
      enumerable: false,
    });
  }

  for (const name of config.remove) {
    try {
      delete globalThis[name];
    } catch (_) {
      // verified below
    }
  }
  const leaked = config.remove.filter((name) => name in globalThis);
  if (leaked.length > 0) {
    throw new Error(`capabilities still reachable: ${leaked.join(", ")}`);
  }
})(Deno.core.ops, __REALM_CONFIG__);
"#;

/// What the bootstrap does with a named global
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Deleted and verified absent
    Remove,
    /// Replaced with a function that always throws
    Block,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapConfig<'a> {
    remove: Vec<&'a str>,
    block: Vec<&'a str>,
    max_timer_delay_ms: u64,
    max_call_chars: usize,
    escape_markup: bool,
}

fn identifier() -> &'static Regex {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT.get_or_init(|| {
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern must compile")
    })
}

/// Builds the bootstrap script from a capability table
#[derive(Debug, Clone)]
pub struct BootstrapBuilder {
    capabilities: BTreeMap<String, Capability>,
    max_timer_delay_ms: u64,
    max_call_chars: usize,
    escape_markup: bool,
}

impl BootstrapBuilder {
    /// Default capability table with the given limits
    pub fn new(limits: &RealmLimits) -> Self {
        let mut capabilities = BTreeMap::new();
        for name in DEFAULT_REMOVED {
            capabilities.insert(name.to_string(), Capability::Remove);
        }
        for name in DEFAULT_BLOCKED {
            capabilities.insert(name.to_string(), Capability::Block);
        }
        Self {
            capabilities,
            ..Self::empty(limits)
        }
    }

    /// No capabilities touched; only the console and timer shims
    pub fn empty(limits: &RealmLimits) -> Self {
        Self {
            capabilities: BTreeMap::new(),
            max_timer_delay_ms: limits.max_timer_delay_ms(),
            max_call_chars: limits.max_output_call_chars,
            escape_markup: limits.escape_markup,
        }
    }

    pub fn remove(self, name: &str) -> Result<Self> {
        self.set(name, Capability::Remove)
    }

    pub fn block(self, name: &str) -> Result<Self> {
        self.set(name, Capability::Block)
    }

    fn set(mut self, name: &str, capability: Capability) -> Result<Self> {
        if !identifier().is_match(name) {
            return Err(SandboxError::setup(format!(
                "Invalid capability name: {:?}",
                name
            )));
        }
        if matches!(name, "console" | "setTimeout" | "clearTimeout") {
            return Err(SandboxError::setup(format!(
                "{} is provided by the realm shim",
                name
            )));
        }
        self.capabilities.insert(name.to_string(), capability);
        Ok(self)
    }

    /// Capability table in name order
    pub fn capabilities(&self) -> impl Iterator<Item = (&str, Capability)> {
        self.capabilities.iter().map(|(name, cap)| (name.as_str(), *cap))
    }

    fn names(&self, wanted: Capability) -> Vec<&str> {
        self.capabilities()
            .filter(|(_, cap)| *cap == wanted)
            .map(|(name, _)| name)
            .collect()
    }

    /// Render the bootstrap script
    pub fn build(&self) -> Result<String> {
        let config = BootstrapConfig {
            remove: self.names(Capability::Remove),
            block: self.names(Capability::Block),
            max_timer_delay_ms: self.max_timer_delay_ms,
            max_call_chars: self.max_call_chars,
            escape_markup: self.escape_markup,
        };
        let json = serde_json::to_string(&config)
            .map_err(|e| SandboxError::setup(format!("Failed to encode bootstrap config: {}", e)))?;
        Ok(TEMPLATE.replacen(CONFIG_PLACEHOLDER, &json, 1))
    }
}
