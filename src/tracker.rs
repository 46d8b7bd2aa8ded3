//! Retry/Blocker Tracker.
//!
//! Counts tool failures per signature (tool name + normalized error text)
//! for one session and decides when a failure stops being retryable.
//! Events must be fed in arrival order; counts only ever grow until
//! [`Tracker::reset`] at the start of the next session.

use regex::Regex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::model::{Document, PauseType};

/// Rewrites volatile substrings so repeats of one error share a signature.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<(Regex, &'static str)>,
    whitespace: Regex,
}

impl Normalizer {
    pub fn new() -> Result<Self> {
        // Applied in order to lower-cased text
        let table: [(&str, &'static str); 7] = [
            (
                r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(z|[+-]\d{2}:?\d{2})?",
                "<ts>",
            ),
            (r"\b\d{2}:\d{2}:\d{2}(\.\d+)?\b", "<ts>"),
            (
                r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                "<id>",
            ),
            (r"\b0x[0-9a-f]+\b", "<hex>"),
            (r#"(^|[\s'"(=])(~|\.{1,2})?/[^\s'"),:;]+"#, "${1}<path>"),
            (r#"\b[a-z]:\\[^\s'"),:;]+"#, "<path>"),
            (r"\d+", "<n>"),
        ];
        let mut rules = Vec::with_capacity(table.len());
        for (pattern, replacement) in table {
            rules.push((compile(pattern)?, replacement));
        }
        Ok(Self {
            rules,
            whitespace: compile(r"\s+")?,
        })
    }

    /// Lower-case, strip volatile parts, collapse whitespace, truncate
    pub fn normalize(&self, text: &str, max_len: usize) -> String {
        let mut out = text.to_lowercase();
        for (re, replacement) in &self.rules {
            out = re.replace_all(&out, *replacement).into_owned();
        }
        let out = self.whitespace.replace_all(out.trim(), " ");
        out.chars().take(max_len).collect()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid pattern '{}': {}", pattern, e)))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FailureSignature {
    pub tool: String,
    pub error: String,
}

#[derive(Debug, Clone)]
struct SignatureStats {
    count: u32,
    last_error: String,
}

/// Everything the Intervention Manager needs to raise a pause
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub pause_type: PauseType,
    pub reason: String,
    pub blocker_info: Document,
    pub retry_stats: Document,
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not a failure
    Success,
    /// Counted, still under threshold (or already escalated this session)
    Retry { count: u32 },
    Escalate(Escalation),
}

#[derive(Debug, Clone)]
pub struct Tracker {
    max_retries: u32,
    timeout: Option<Duration>,
    max_len: usize,
    critical: Vec<Regex>,
    normalizer: Normalizer,
    counters: BTreeMap<FailureSignature, SignatureStats>,
    current_task: Option<String>,
    escalated: bool,
}

impl Tracker {
    pub fn new(config: &RetryConfig) -> Result<Self> {
        let critical = config
            .critical_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            max_retries: config.max_retries_per_signature,
            timeout: config.session_timeout(),
            max_len: config.signature_max_len,
            critical,
            normalizer: Normalizer::new()?,
            counters: BTreeMap::new(),
            current_task: None,
            escalated: false,
        })
    }

    /// Forget everything; called when a new session starts
    pub fn reset(&mut self) {
        self.counters.clear();
        self.current_task = None;
        self.escalated = false;
    }

    pub fn has_escalated(&self) -> bool {
        self.escalated
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    pub fn set_current_task(&mut self, task_id: Option<String>) {
        self.current_task = task_id;
    }

    /// Note a tool invocation; a known task id becomes the current task
    pub fn on_tool_use(&mut self, _tool: &str, task_id: Option<&str>) {
        if let Some(id) = task_id {
            self.current_task = Some(id.to_string());
        }
    }

    pub fn signature(&self, tool: &str, error_text: &str) -> FailureSignature {
        FailureSignature {
            tool: tool.to_string(),
            error: self.normalizer.normalize(error_text, self.max_len),
        }
    }

    /// Current count for the signature `error_text` normalizes to
    pub fn count(&self, tool: &str, error_text: &str) -> u32 {
        self.counters
            .get(&self.signature(tool, error_text))
            .map(|s| s.count)
            .unwrap_or(0)
    }

    /// Classify one tool result
    pub fn on_tool_result(&mut self, tool: &str, is_error: bool, error_text: &str) -> Verdict {
        if !is_error {
            return Verdict::Success;
        }

        if !self.escalated
            && let Some(pattern) = self.critical.iter().find(|re| re.is_match(error_text))
        {
            let mut blocker = Document::new();
            blocker.insert("tool".into(), json!(tool));
            blocker.insert("error".into(), json!(truncate(error_text, 2000)));
            blocker.insert("pattern".into(), json!(pattern.as_str()));
            let reason = format!(
                "critical error from {}: {}",
                tool,
                truncate(error_text, 200)
            );
            return Verdict::Escalate(self.escalate(PauseType::CriticalError, reason, blocker));
        }

        let signature = self.signature(tool, error_text);
        let stats = self
            .counters
            .entry(signature.clone())
            .or_insert(SignatureStats {
                count: 0,
                last_error: String::new(),
            });
        stats.count += 1;
        stats.last_error = truncate(error_text, 2000);
        let count = stats.count;

        if count <= self.max_retries || self.escalated {
            tracing::debug!(tool, count, signature = %signature.error, "tool failure counted");
            return Verdict::Retry { count };
        }

        let mut blocker = Document::new();
        blocker.insert("tool".into(), json!(tool));
        blocker.insert("error".into(), json!(truncate(error_text, 2000)));
        blocker.insert("signature".into(), json!(signature.error));
        blocker.insert("count".into(), json!(count));
        let reason = format!(
            "{} failed {} times with the same error (limit {}): {}",
            tool,
            count,
            self.max_retries,
            truncate(error_text, 200)
        );
        Verdict::Escalate(self.escalate(PauseType::RetryLimit, reason, blocker))
    }

    /// Escalate once when the wall-clock budget is exceeded
    pub fn check_timeout(&mut self, elapsed: Duration) -> Option<Escalation> {
        let limit = self.timeout?;
        if self.escalated || elapsed <= limit {
            return None;
        }
        let mut blocker = Document::new();
        blocker.insert("elapsed_secs".into(), json!(elapsed.as_secs()));
        blocker.insert("timeout_secs".into(), json!(limit.as_secs()));
        let reason = format!(
            "session exceeded its {}s wall-clock budget",
            limit.as_secs()
        );
        Some(self.escalate(PauseType::Timeout, reason, blocker))
    }

    /// Escalate an error the runtime itself reported (launch failure,
    /// session_error event). Returns None if this session already escalated.
    pub fn critical_error(&mut self, source: &str, message: &str) -> Option<Escalation> {
        if self.escalated {
            return None;
        }
        let mut blocker = Document::new();
        blocker.insert("source".into(), json!(source));
        blocker.insert("error".into(), json!(truncate(message, 2000)));
        let reason = format!("{}: {}", source, truncate(message, 200));
        Some(self.escalate(PauseType::CriticalError, reason, blocker))
    }

    /// Snapshot of all counters, largest first
    pub fn retry_stats(&self) -> Document {
        let mut entries: Vec<(&FailureSignature, &SignatureStats)> = self.counters.iter().collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        let signatures: Vec<Value> = entries
            .iter()
            .map(|(sig, stats)| {
                json!({
                    "tool": sig.tool,
                    "error": sig.error,
                    "count": stats.count,
                    "last_error": stats.last_error,
                })
            })
            .collect();
        let total: u64 = self.counters.values().map(|s| u64::from(s.count)).sum();

        let mut doc = Document::new();
        doc.insert("signatures".into(), Value::Array(signatures));
        doc.insert("total_failures".into(), json!(total));
        doc.insert("max_retries_per_signature".into(), json!(self.max_retries));
        doc
    }

    fn escalate(&mut self, pause_type: PauseType, reason: String, mut blocker: Document) -> Escalation {
        self.escalated = true;
        if let Some(task) = &self.current_task {
            blocker.insert("task_id".into(), json!(task));
        }
        Escalation {
            pause_type,
            reason,
            blocker_info: blocker,
            retry_stats: self.retry_stats(),
            current_task_id: self.current_task.clone(),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: u32) -> Tracker {
        let config = RetryConfig {
            max_retries_per_signature: max,
            ..RetryConfig::default()
        };
        Tracker::new(&config).unwrap()
    }

    #[test]
    fn test_escalates_on_eleventh_occurrence() {
        let mut t = tracker(10);
        for i in 1..=10 {
            let verdict = t.on_tool_result("Bash", true, "cargo: build failed");
            assert_eq!(verdict, Verdict::Retry { count: i });
        }
        match t.on_tool_result("Bash", true, "cargo: build failed") {
            Verdict::Escalate(e) => {
                assert_eq!(e.pause_type, PauseType::RetryLimit);
                let sigs = e.retry_stats["signatures"].as_array().unwrap();
                assert_eq!(sigs[0]["count"], json!(11));
                assert_eq!(e.blocker_info["count"], json!(11));
            }
            other => panic!("expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_volatile_parts_share_a_signature() {
        let mut t = tracker(10);
        t.on_tool_result(
            "Bash",
            true,
            "Error at 2024-01-02T10:11:12Z reading /tmp/run-17/out.log: exit 1",
        );
        t.on_tool_result(
            "Bash",
            true,
            "error at 2025-06-07 08:09:10 reading /var/tmp/x/y.log: exit 2",
        );
        assert_eq!(t.count("Bash", "ERROR at 2030-01-01T00:00:00Z reading /a/b: exit 9"), 2);
    }

    #[test]
    fn test_different_tools_are_different_signatures() {
        let mut t = tracker(10);
        t.on_tool_result("Bash", true, "not found");
        t.on_tool_result("Read", true, "not found");
        assert_eq!(t.count("Bash", "not found"), 1);
        assert_eq!(t.count("Read", "not found"), 1);
    }

    #[test]
    fn test_success_does_not_count() {
        let mut t = tracker(1);
        assert_eq!(t.on_tool_result("Bash", false, "ok"), Verdict::Success);
        assert_eq!(t.count("Bash", "ok"), 0);
    }

    #[test]
    fn test_critical_escalates_first_time_without_counting() {
        let mut t = tracker(10);
        match t.on_tool_result("Bash", true, "Error: Invalid API key provided") {
            Verdict::Escalate(e) => assert_eq!(e.pause_type, PauseType::CriticalError),
            other => panic!("expected escalation, got {:?}", other),
        }
        assert_eq!(t.count("Bash", "Error: Invalid API key provided"), 0);
    }

    #[test]
    fn test_escalates_once_per_session_and_resets() {
        let mut t = tracker(0);
        assert!(matches!(
            t.on_tool_result("Bash", true, "boom"),
            Verdict::Escalate(_)
        ));
        assert_eq!(
            t.on_tool_result("Bash", true, "boom"),
            Verdict::Retry { count: 2 }
        );
        assert!(t.has_escalated());

        t.reset();
        assert_eq!(t.count("Bash", "boom"), 0);
        assert!(!t.has_escalated());
        assert!(matches!(
            t.on_tool_result("Bash", true, "boom"),
            Verdict::Escalate(_)
        ));
    }

    #[test]
    fn test_timeout() {
        let config = RetryConfig {
            session_timeout_secs: 60,
            ..RetryConfig::default()
        };
        let mut t = Tracker::new(&config).unwrap();
        assert!(t.check_timeout(Duration::from_secs(60)).is_none());
        let e = t.check_timeout(Duration::from_secs(61)).unwrap();
        assert_eq!(e.pause_type, PauseType::Timeout);
        assert!(t.check_timeout(Duration::from_secs(120)).is_none());
    }

    #[test]
    fn test_no_timeout_when_disabled() {
        let config = RetryConfig {
            session_timeout_secs: 0,
            ..RetryConfig::default()
        };
        let mut t = Tracker::new(&config).unwrap();
        assert!(t.check_timeout(Duration::from_secs(1_000_000)).is_none());
    }

    #[test]
    fn test_current_task_is_reported() {
        let mut t = tracker(0);
        t.set_current_task(Some("task-1".into()));
        t.on_tool_use("Bash", Some("task-2"));
        match t.on_tool_result("Bash", true, "boom") {
            Verdict::Escalate(e) => {
                assert_eq!(e.current_task_id.as_deref(), Some("task-2"));
                assert_eq!(e.blocker_info["task_id"], json!("task-2"));
            }
            other => panic!("expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_critical_pattern_is_config_error() {
        let config = RetryConfig {
            critical_patterns: vec!["(unclosed".into()],
            ..RetryConfig::default()
        };
        let err = Tracker::new(&config).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn test_normalize() {
        let n = Normalizer::new().unwrap();
        assert_eq!(
            n.normalize("  Failed   to open /home/u/x.rs: code 13 ", 200),
            "failed to open <path>: code <n>"
        );
        assert_eq!(
            n.normalize("request 123e4567-e89b-12d3-a456-426614174000 failed", 200),
            "request <id> failed"
        );
        assert_eq!(n.normalize("abcdef", 3), "abc");
    }
}
