//! Secret redaction for diagnostic text the engine surfaces.
//!
//! Runtime stderr and agent stderr can echo environment or payload contents.
//! Anything the engine itself puts into a `typed_error` message or an `exit`
//! reason goes through here first.

use regex::Regex;

use crate::credentials::CredentialSet;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Redacts known secret values and token-like patterns.
#[derive(Debug, Clone)]
pub struct Redactor {
    exact_secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Redactor {
    /// Create a redactor from known secret values.
    pub fn new(exact_secrets: Vec<String>) -> Self {
        let mut exact_secrets = exact_secrets;
        // Longest first so a secret containing another is replaced whole.
        exact_secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        Self {
            exact_secrets,
            patterns: default_patterns(),
        }
    }

    /// Redactor seeded with every value in a credential set.
    pub fn for_credentials(credentials: &CredentialSet) -> Self {
        Self::new(credentials.known_secrets())
    }

    /// Redact exact known secrets and known secret patterns.
    pub fn redact(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for secret in &self.exact_secrets {
            if !secret.is_empty() {
                sanitized = sanitized.replace(secret.as_str(), REDACTION_MARKER);
            }
        }
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }
}

fn default_patterns() -> Vec<Regex> {
    let patterns = [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"ghp_[A-Za-z0-9]{20,}",
        r"github_pat_[A-Za-z0-9_]{20,}",
        r"glpat-[A-Za-z0-9_\-]{16,}",
        r"xoxb-[A-Za-z0-9\-]{20,}",
        r"\d{8,10}:[A-Za-z0-9_\-]{35}",
    ];

    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}
