//! Built-in pattern catalog for output classification.
//!
//! Pattern groups carry a priority so that overlapping matches resolve
//! deterministically: error beats complete beats processing beats ready.

use once_cell::sync::Lazy;
use regex::Regex;

/// Spinner glyphs emitted by AI CLIs while working.
pub const SPINNER_CHARS: [char; 6] = ['·', '✻', '✽', '✶', '✳', '✢'];

/// A named set of patterns mapping onto one semantic state.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    pub name: String,
    pub priority: i32,
    pub confidence: f64,
    pub patterns: Vec<Regex>,
}

impl PatternGroup {
    pub fn new(name: &str, priority: i32, confidence: f64, patterns: Vec<Regex>) -> Self {
        Self {
            name: name.to_string(),
            priority,
            confidence,
            patterns,
        }
    }

    /// First matching pattern in the group, with the matched text.
    pub fn find_match<'t>(&self, text: &'t str) -> Option<(&Regex, &'t str)> {
        for pattern in &self.patterns {
            if let Some(m) = pattern.find(text) {
                return Some((pattern, m.as_str()));
            }
        }
        None
    }
}

fn rx(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static DEFAULT_GROUPS: Lazy<Vec<PatternGroup>> = Lazy::new(|| {
    vec![
        PatternGroup::new(
            "error",
            100,
            0.9,
            vec![
                rx(r"(?m)^\s*✖"),
                rx(r"(?i)\b(error|failed|failure)[:!]"),
                rx(r"command not found"),
                rx(r"(?i)fatal:"),
                rx(r"Traceback \(most recent call last\)"),
                rx(r"thread '[^']*' panicked"),
            ],
        ),
        PatternGroup::new(
            "complete",
            90,
            0.85,
            vec![
                rx(r"(?m)^\s*[✓✔]"),
                rx(r"(?i)\b(done|complete|completed|finished)[.!]"),
                rx(r"(?i)successfully\b"),
            ],
        ),
        PatternGroup::new(
            "processing",
            80,
            0.8,
            vec![
                rx(r"(?i)\b(thinking|analyzing|generating|running|working)\b[.…]*"),
                rx(r"[·✻✽✶✳✢]\s+\S"),
                rx(r"\b\d{1,3}%"),
            ],
        ),
        // Anchored to end of buffer: a prompt that has scrolled away
        // under newer output is not a prompt anymore.
        PatternGroup::new(
            "ready",
            70,
            0.9,
            vec![rx(r"[$%#>]\s*\z"), rx(r"(?m)^[❯>]\s*\z")],
        ),
    ]
});

/// Fresh copy of the built-in state groups, sorted by descending priority.
pub fn default_state_groups() -> Vec<PatternGroup> {
    DEFAULT_GROUPS.clone()
}

/// Per-agent-flavor readiness detection: which prompt patterns mean "the
/// CLI is waiting for input", and how much trailing output to examine.
#[derive(Debug, Clone)]
pub struct ReadinessProfile {
    pub kind: String,
    pub buffer_budget: usize,
    pub confidence: f64,
    pub patterns: Vec<Regex>,
}

impl ReadinessProfile {
    pub fn builtin(kind: &str) -> Option<Self> {
        match kind {
            "claude" => Some(Self {
                kind: "claude".to_string(),
                buffer_budget: 3072,
                confidence: 0.95,
                patterns: vec![
                    rx(r"(?m)^\s*❯\s*\z"),
                    rx(r"(?m)^\s*>\s*\z"),
                    rx(r"\? for shortcuts\s*\z"),
                ],
            }),
            "aider" => Some(Self {
                kind: "aider".to_string(),
                buffer_budget: 2048,
                confidence: 0.9,
                patterns: vec![rx(r"(?m)^[a-z-]*>\s*\z")],
            }),
            "codex" => Some(Self {
                kind: "codex".to_string(),
                buffer_budget: 2048,
                confidence: 0.9,
                patterns: vec![rx(r"(?m)^\s*[›❯]\s*\z"), rx(r"(?i)send a message\s*\z")],
            }),
            "shell" => Some(Self {
                kind: "shell".to_string(),
                buffer_budget: 1024,
                confidence: 0.85,
                patterns: vec![rx(r"[$%#>]\s*\z")],
            }),
            _ => None,
        }
    }

    /// Match any profile pattern against trailing output.
    pub fn find_match<'t>(&self, tail: &'t str) -> Option<&'t str> {
        for pattern in &self.patterns {
            if let Some(m) = pattern.find(tail) {
                return Some(m.as_str());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_groups_sorted_by_priority() {
        let groups = default_state_groups();
        let priorities: Vec<i32> = groups.iter().map(|g| g.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn test_error_patterns() {
        let groups = default_state_groups();
        let error = groups.iter().find(|g| g.name == "error").unwrap();
        assert!(error.find_match("Error: something broke").is_some());
        assert!(error.find_match("bash: foo: command not found").is_some());
        assert!(error.find_match("fatal: not a git repository").is_some());
        assert!(error.find_match("all good here").is_none());
    }

    #[test]
    fn test_spinner_matches_processing() {
        let groups = default_state_groups();
        let processing = groups.iter().find(|g| g.name == "processing").unwrap();
        for ch in SPINNER_CHARS {
            let line = format!("{ch} Churning");
            assert!(processing.find_match(&line).is_some(), "spinner {ch}");
        }
    }

    #[test]
    fn test_shell_prompt_readiness() {
        let profile = ReadinessProfile::builtin("shell").unwrap();
        assert!(profile.find_match("user@host:~$ ").is_some());
        assert!(profile.find_match("still running...").is_none());
    }

    #[test]
    fn test_claude_prompt_readiness() {
        let profile = ReadinessProfile::builtin("claude").unwrap();
        assert!(profile.find_match("some output\n❯ ").is_some());
        assert!(profile.find_match("✻ Thinking…").is_none());
    }

    #[test]
    fn test_unknown_builtin_is_none() {
        assert!(ReadinessProfile::builtin("mystery").is_none());
    }
}
