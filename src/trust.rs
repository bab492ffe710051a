//! Trust designation parsing.
//!
//! Every execution runs under exactly one canonical [`TrustMode`]. Legacy
//! spellings accepted from older workspace records and bot configs are folded
//! into the two canonical values here; nothing downstream ever sees the raw
//! string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum TrustMode {
    /// Run the agent directly on the host.
    Direct,
    /// Run the agent inside a managed container.
    Sandboxed,
}

impl TrustMode {
    /// Canonical lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Sandboxed => "sandboxed",
        }
    }
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted spellings and the mode each maps to.
const ACCEPTED: &[(&str, TrustMode)] = &[
    ("direct", TrustMode::Direct),
    ("sandboxed", TrustMode::Sandboxed),
    ("trusted", TrustMode::Direct),
    ("full", TrustMode::Direct),
    ("vault", TrustMode::Direct),
    ("untrusted", TrustMode::Sandboxed),
];

/// Trust designation parsing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrustError {
    /// The value is neither canonical nor a recognised legacy alias.
    #[error("invalid trust value '{value}': expected one of {}", accepted_values().join(", "))]
    InvalidTrustValue {
        /// The rejected input, as given.
        value: String,
    },
}

/// Resolve a raw trust designation into its canonical mode.
///
/// Matching ignores ASCII case and surrounding whitespace.
///
/// # Errors
///
/// Returns [`TrustError::InvalidTrustValue`] listing every accepted value
/// when `raw` is not recognised.
pub fn resolve(raw: &str) -> Result<TrustMode, TrustError> {
    let needle = raw.trim();
    ACCEPTED
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(needle))
        .map(|(_, mode)| *mode)
        .ok_or_else(|| TrustError::InvalidTrustValue {
            value: raw.to_owned(),
        })
}

/// Every spelling [`resolve`] accepts, canonical values first.
pub fn accepted_values() -> Vec<&'static str> {
    ACCEPTED.iter().map(|(name, _)| *name).collect()
}

impl FromStr for TrustMode {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resolve(s)
    }
}

impl TryFrom<String> for TrustMode {
    type Error = TrustError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        resolve(&value)
    }
}
