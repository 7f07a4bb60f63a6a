use regex::Regex;

use crate::error::EngineResult;

/// Redacts sensitive content before anything is persisted or logged.
pub trait SecurityGate: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

/// Regex redaction of PII, credentials and prompt-injection phrases.
pub struct PatternGate {
    rules: Vec<(Regex, &'static str)>,
}

impl PatternGate {
    pub fn new() -> EngineResult<Self> {
        let rules = vec![
            (
                Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
                "[REDACTED_EMAIL]",
            ),
            (
                Regex::new(r"\b(?:sk-[A-Za-z0-9\-_]{20,}|ghp_[A-Za-z0-9]{36}|AIza[0-9A-Za-z\-_]{35})")?,
                "[REDACTED_SECRET]",
            ),
            (Regex::new(r"(?i)\bbearer\s+[^\s]{20,}")?, "[REDACTED_SECRET]"),
            (Regex::new(r"\b\d{3}-\d{2}-\d{4}\b")?, "[REDACTED_ID]"),
            (
                Regex::new(r"(?:\+\d{1,3}[\s.\-]?)?\(?\b\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}\b")?,
                "[REDACTED_PHONE]",
            ),
            (Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b")?, "[REDACTED_NUMBER]"),
            (
                Regex::new(
                    r"(?i)\b(?:ignore (?:all )?previous instructions|disregard all(?: prior)? instructions|new system prompt|you are now in developer mode|jailbreak)\b",
                )?,
                "[REDACTED_INJECTION]",
            ),
        ];
        Ok(Self { rules })
    }
}

impl SecurityGate for PatternGate {
    fn sanitize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, *replacement).into_owned();
            }
        }
        out
    }
}

/// Gate that returns text unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughGate;

impl SecurityGate for PassthroughGate {
    fn sanitize(&self, text: &str) -> String {
        text.to_string()
    }
}
