//! Static sanitizer: rewrite-then-scan pass over submitted source text.
//!
//! Stage 1 neutralizes markup and replaces dynamic-evaluation and DOM-write
//! call sites with sentinel tokens. Stage 2 scans the rewritten text against a
//! categorized blocklist; the first match rejects the submission.
//!
//! This pass only catches the obvious constructs. The realm bootstrap is the
//! enforcement boundary.

use crate::error::SandboxError;
use coderealm_common::Language;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Sentinel replacing `eval(`
pub const EVAL_SENTINEL: &str = "__SANDBOX_BLOCKED_EVAL__";
/// Sentinel replacing `Function(` and `new Function(`
pub const FUNCTION_SENTINEL: &str = "__SANDBOX_BLOCKED_FUNCTION__";
/// Sentinel replacing direct document writes
pub const DOM_WRITE_SENTINEL: &str = "__SANDBOX_BLOCKED_DOM_WRITE__";

/// Blocklist category of a rejected construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedCategory {
    DynamicEvaluation,
    FileSystem,
    Process,
    Network,
    Storage,
    GlobalMutation,
    PrototypePollution,
}

impl BlockedCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedCategory::DynamicEvaluation => "dynamic evaluation",
            BlockedCategory::FileSystem => "filesystem",
            BlockedCategory::Process => "process",
            BlockedCategory::Network => "network",
            BlockedCategory::Storage => "storage",
            BlockedCategory::GlobalMutation => "global mutation",
            BlockedCategory::PrototypePollution => "prototype pollution",
        }
    }
}

impl fmt::Display for BlockedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage-1 rule that fired, and how often
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRewrite {
    pub rule: &'static str,
    pub count: usize,
}

/// Source text that went through the sanitizer.
///
/// Only [`StaticSanitizer::process`] can build one, and it is the only thing a
/// realm accepts for injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedText {
    text: String,
    rewrites: Vec<AppliedRewrite>,
}

impl SanitizedText {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Audit trail of stage-1 rewrites
    pub fn rewrites(&self) -> &[AppliedRewrite] {
        &self.rewrites
    }

    pub fn was_rewritten(&self) -> bool {
        !self.rewrites.is_empty()
    }
}

/// Why a submission was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Oversized, empty, or empty once rewritten
    Invalid { reason: String },
    /// Language tag is not executable
    UnsupportedLanguage { language: String },
    /// Matched a blocklist entry
    Blocked {
        category: BlockedCategory,
        pattern: &'static str,
    },
}

impl Rejection {
    pub fn into_error(self) -> SandboxError {
        match self {
            Rejection::Invalid { reason } => SandboxError::Validation { reason },
            Rejection::UnsupportedLanguage { language } => {
                SandboxError::UnsupportedLanguage { language }
            }
            Rejection::Blocked { category, pattern } => SandboxError::BlockedPattern {
                category,
                pattern: pattern.to_string(),
            },
        }
    }
}

impl From<Rejection> for SandboxError {
    fn from(rejection: Rejection) -> Self {
        rejection.into_error()
    }
}

/// Result of [`StaticSanitizer::process`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizedSource {
    Accepted(SanitizedText),
    Rejected(Rejection),
}

impl SanitizedSource {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SanitizedSource::Accepted(_))
    }

    pub fn into_result(self) -> Result<SanitizedText, SandboxError> {
        match self {
            SanitizedSource::Accepted(text) => Ok(text),
            SanitizedSource::Rejected(rejection) => Err(rejection.into_error()),
        }
    }
}

struct RewriteRule {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

struct BlockRule {
    category: BlockedCategory,
    label: &'static str,
    regex: Regex,
}

// Identifier prefix guard: the call must not be a member access or part of a
// longer identifier. The regex crate has no lookbehind.
const CALL_PREFIX: &str = r"(^|[^\w$.])";

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static sanitizer pattern must compile")
}

fn rewrite_rules() -> &'static [RewriteRule] {
    static RULES: OnceLock<Vec<RewriteRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |name, pattern: &str, replacement| RewriteRule {
            name,
            regex: compile(pattern),
            replacement,
        };
        vec![
            rule("script_block", r"(?is)<script\b[^>]*>.*?</script\s*>", ""),
            rule(
                "markup_tag",
                r"(?i)</?(?:script|iframe|frame|frameset|object|embed|applet|link|meta|base|form|style|svg)\b[^>]*>",
                "",
            ),
            rule("javascript_uri", r"(?i)\bjavascript\s*:", "blocked:"),
            rule(
                "event_handler_attribute",
                r#"(?i)(<[^<>]*?)\s+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
                "${1}",
            ),
            rule(
                "dynamic_eval",
                &format!(r"{CALL_PREFIX}eval\s*\("),
                "${1}__SANDBOX_BLOCKED_EVAL__(",
            ),
            rule(
                "dynamic_function",
                &format!(r"{CALL_PREFIX}(?:new\s+)?Function\s*\("),
                "${1}__SANDBOX_BLOCKED_FUNCTION__(",
            ),
            rule(
                "document_write",
                r"\bdocument\s*\.\s*write(?:ln)?\s*\(",
                "__SANDBOX_BLOCKED_DOM_WRITE__(",
            ),
            rule(
                "html_assignment",
                r"\.\s*(?:innerHTML|outerHTML)\s*(\+?=)([^=]|$)",
                ".__SANDBOX_BLOCKED_DOM_WRITE__${1}${2}",
            ),
            rule(
                "insert_adjacent_html",
                r"\.\s*insertAdjacentHTML\s*\(",
                ".__SANDBOX_BLOCKED_DOM_WRITE__(",
            ),
        ]
    })
}

fn block_rules() -> &'static [BlockRule] {
    static RULES: OnceLock<Vec<BlockRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        use BlockedCategory::*;
        let rule = |category, label, pattern: &str| BlockRule {
            category,
            label,
            regex: compile(pattern),
        };
        let call = |name: &str| format!(r"(?:^|[^\w$.]){name}\s*\(");
        vec![
            rule(DynamicEvaluation, "eval()", EVAL_SENTINEL),
            rule(DynamicEvaluation, "Function()", FUNCTION_SENTINEL),
            rule(DynamicEvaluation, "runtime internals", r"\b__bootstrap\b|\bevalContext\b"),
            rule(
                DynamicEvaluation,
                "string timer",
                r#"(?:^|[^\w$.])set(?:Timeout|Interval)\s*\(\s*['"`]"#,
            ),
            rule(
                FileSystem,
                "fs module",
                r#"(?:require\s*\(|\bfrom)\s*['"`](?:node:)?fs(?:/promises)?['"`]"#,
            ),
            rule(
                FileSystem,
                "sync file api",
                r"\b(?:readFileSync|writeFileSync|appendFileSync|unlinkSync|readdirSync|rmSync)\b",
            ),
            rule(
                FileSystem,
                "Deno file api",
                r"\bDeno\s*\.\s*(?:readFile|readTextFile|writeFile|writeTextFile|open|remove|mkdir|readDir)\b",
            ),
            rule(Process, "child_process", r"\bchild_process\b"),
            rule(
                Process,
                "process object",
                r"(?:^|[^\w$.])process\s*\.\s*(?:exit|kill|env|binding|dlopen|spawn|argv|cwd|chdir)\b",
            ),
            rule(
                Process,
                "subprocess call",
                r"\b(?:execSync|spawnSync|execFile|execFileSync)\s*\(",
            ),
            rule(Process, "Deno process api", r"\bDeno\s*\.\s*(?:run|Command|exit|env)\b"),
            rule(Network, "fetch()", &call("fetch")),
            rule(Network, "XMLHttpRequest", r"\bXMLHttpRequest\b"),
            rule(Network, "WebSocket", r"\bWebSocket\b"),
            rule(Network, "EventSource", r"\bEventSource\b"),
            rule(Network, "sendBeacon", r"\bsendBeacon\b"),
            rule(Network, "import()", &call("import")),
            rule(Network, "importScripts", r"\bimportScripts\b"),
            rule(Storage, "localStorage", r"\blocalStorage\b"),
            rule(Storage, "sessionStorage", r"\bsessionStorage\b"),
            rule(Storage, "indexedDB", r"\bindexedDB\b"),
            rule(Storage, "cookie", r"\bdocument\s*\.\s*cookie\b"),
            rule(GlobalMutation, "DOM write", DOM_WRITE_SENTINEL),
            rule(GlobalMutation, "window access", r"(?:^|[^\w$.])window\s*[.\[]"),
            rule(
                GlobalMutation,
                "document access",
                r"(?:^|[^\w$.])document\s*\.\s*(?:body|head|documentElement|createElement|getElementById|getElementsBy\w+|querySelector(?:All)?|location|domain|forms|scripts|open|close)\b",
            ),
            rule(
                GlobalMutation,
                "frame traversal",
                r"(?:^|[^\w$.])(?:parent|top|opener|frames)\s*\.\s*(?:postMessage|document|location|window|opener|frames)\b",
            ),
            rule(
                GlobalMutation,
                "globalThis assignment",
                r"\bglobalThis\s*(?:\.\s*[\w$]+|\[[^\]]*\])\s*=(?:[^=]|$)",
            ),
            rule(PrototypePollution, "__proto__", r"__proto__"),
            rule(
                PrototypePollution,
                "constructor.prototype",
                r"\bconstructor\s*\.\s*prototype\b",
            ),
            rule(PrototypePollution, "setPrototypeOf", r"\bsetPrototypeOf\b"),
        ]
    })
}

/// Rewrite-and-reject pass applied before any code reaches a realm
#[derive(Debug, Clone)]
pub struct StaticSanitizer {
    max_source_bytes: usize,
}

impl StaticSanitizer {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Bound, rewrite and scan `source_text`
    pub fn process(&self, source_text: &str, language: &Language) -> SanitizedSource {
        if source_text.len() > self.max_source_bytes {
            return SanitizedSource::Rejected(Rejection::Invalid {
                reason: format!(
                    "Source is {} bytes, limit is {}",
                    source_text.len(),
                    self.max_source_bytes
                ),
            });
        }
        if !language.is_executable() {
            return SanitizedSource::Rejected(Rejection::UnsupportedLanguage {
                language: language.to_string(),
            });
        }
        if source_text.trim().is_empty() {
            return SanitizedSource::Rejected(Rejection::Invalid {
                reason: "Source is empty".to_string(),
            });
        }

        let (text, rewrites) = Self::rewrite(source_text);
        if text.trim().is_empty() {
            return SanitizedSource::Rejected(Rejection::Invalid {
                reason: "Source is empty after sanitization".to_string(),
            });
        }

        if let Some(rule) = block_rules().iter().find(|r| r.regex.is_match(&text)) {
            tracing::warn!(
                category = %rule.category,
                pattern = rule.label,
                "Blocked pattern in submitted source"
            );
            return SanitizedSource::Rejected(Rejection::Blocked {
                category: rule.category,
                pattern: rule.label,
            });
        }

        if !rewrites.is_empty() {
            tracing::debug!(rewrites = ?rewrites, "Source rewritten");
        }
        SanitizedSource::Accepted(SanitizedText { text, rewrites })
    }

    /// Stage 1 only
    fn rewrite(source_text: &str) -> (String, Vec<AppliedRewrite>) {
        let mut text = source_text.to_string();
        let mut applied = Vec::new();
        for rule in rewrite_rules() {
            let count = rule.regex.find_iter(&text).count();
            if count == 0 {
                continue;
            }
            text = rule.regex.replace_all(&text, rule.replacement).into_owned();
            applied.push(AppliedRewrite {
                rule: rule.name,
                count,
            });
        }
        (text, applied)
    }
}

impl Default for StaticSanitizer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}
