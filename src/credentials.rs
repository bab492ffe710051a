//! Credential gate: per-vault secret loading and the per-session exposure
//! decision.
//!
//! Secrets live in one YAML key/value file per vault
//! (`<vault>/.warden/secrets/credentials.yaml`). Names on [`DENY_LIST`] are
//! dropped while parsing and can never appear in a returned set. The exposure
//! decision fails closed: bot-originated or unidentified sessions get nothing.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::session::SessionSource;

/// Location of the credentials file relative to a vault root.
pub const CREDENTIALS_FILE: &str = ".warden/secrets/credentials.yaml";

/// Directory holding host-only secrets inside a vault; masked in containers.
pub const SECRETS_DIR: &str = ".warden/secrets";

/// Names that must never leave the host, matched case-insensitively.
///
/// Long-lived auth tokens for the agent platform itself, and variables that
/// make an interpreter or the dynamic loader run code at startup.
pub const DENY_LIST: &[&str] = &[
    "CLAUDE_CODE_OAUTH_TOKEN",
    "ANTHROPIC_OAUTH_TOKEN",
    "ANTHROPIC_AUTH_TOKEN",
    "WARDEN_MASTER_TOKEN",
    "PYTHONSTARTUP",
    "PYTHONPATH",
    "PYTHONHOME",
    "NODE_OPTIONS",
    "PERL5OPT",
    "RUBYOPT",
    "BASH_ENV",
    "ENV",
    "PROMPT_COMMAND",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
];

/// Returns `true` when `name` is on the deny-list.
pub fn is_denied(name: &str) -> bool {
    let name = name.trim();
    DENY_LIST.iter().any(|denied| denied.eq_ignore_ascii_case(name))
}

/// Secret name to value mapping.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CredentialSet {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl CredentialSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from a map, dropping deny-listed names.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        let vars = vars
            .into_iter()
            .filter(|(name, _)| !is_denied(name))
            .collect();
        Self { vars }
    }

    /// Returns a credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Whether the set holds no credentials.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Credential names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Returns all non-empty credential values for redaction purposes.
    pub fn known_secrets(&self) -> Vec<String> {
        self.vars
            .values()
            .filter(|value| !value.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// Outcome of the per-session exposure decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialDecision {
    /// The session may see this set.
    Granted(CredentialSet),
    /// The gate withheld every secret.
    Denied {
        /// Why the gate closed.
        reason: String,
    },
}

impl CredentialDecision {
    /// The set to hand to the execution; empty when denied.
    pub fn into_set(self) -> CredentialSet {
        match self {
            Self::Granted(set) => set,
            Self::Denied { .. } => CredentialSet::empty(),
        }
    }

    /// Whether the gate withheld the secrets.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

/// Credential loading failures.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The file could not be read or inspected.
    #[error("failed to read credentials file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is readable by group or others.
    #[error("credentials file {path} must be 0600, found {mode:o}")]
    InsecurePermissions {
        /// File path.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },
    /// The file is not a flat key/value mapping.
    #[error("failed to parse credentials file {path}: {message}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// The blocking load task did not complete.
    #[error("credential load task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
struct CachedSet {
    modified: SystemTime,
    len: u64,
    set: Arc<CredentialSet>,
}

/// Loads vault credentials and decides what a session may see.
///
/// Parsed sets are cached per file and reused until the file's modification
/// time (or size) changes.
#[derive(Debug, Default)]
pub struct CredentialGate {
    cache: Mutex<HashMap<PathBuf, CachedSet>>,
}

impl CredentialGate {
    /// Create a gate with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the credentials file for a vault root.
    pub fn credentials_path(vault_root: &Path) -> PathBuf {
        vault_root.join(CREDENTIALS_FILE)
    }

    /// Load the credential set for a vault.
    ///
    /// Blocking; async callers should go through [`decide_blocking`](Self::decide_blocking).
    /// A vault without a credentials file yields the empty set.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, is group/world
    /// accessible, or is not a flat mapping.
    pub fn load(&self, vault_root: &Path) -> Result<Arc<CredentialSet>, CredentialError> {
        let path = Self::credentials_path(vault_root);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no credentials file in vault");
                self.lock_cache().remove(&path);
                return Ok(Arc::new(CredentialSet::empty()));
            }
            Err(source) => return Err(CredentialError::Io { path, source }),
        };
        let modified = metadata
            .modified()
            .map_err(|source| CredentialError::Io {
                path: path.clone(),
                source,
            })?;
        let len = metadata.len();

        if let Some(cached) = self.lock_cache().get(&path) {
            if cached.modified == modified && cached.len == len {
                return Ok(Arc::clone(&cached.set));
            }
        }

        validate_private_permissions(&path, &metadata)?;
        let contents = fs::read_to_string(&path).map_err(|source| CredentialError::Io {
            path: path.clone(),
            source,
        })?;
        let set = Arc::new(parse_credentials(&path, &contents)?);
        debug!(path = %path.display(), count = set.len(), "credentials loaded");

        self.lock_cache().insert(
            path,
            CachedSet {
                modified,
                len,
                set: Arc::clone(&set),
            },
        );
        Ok(set)
    }

    /// Decide which credentials a session may see.
    ///
    /// Bot platforms and sessions with no identified source always receive
    /// [`CredentialDecision::Denied`], whatever the file contains.
    ///
    /// # Errors
    ///
    /// Returns an error only when a trusted session's credentials fail to load.
    pub fn decide(
        &self,
        source: Option<SessionSource>,
        vault_root: &Path,
    ) -> Result<CredentialDecision, CredentialError> {
        match source {
            Some(SessionSource::App) => {
                let set = self.load(vault_root)?;
                Ok(CredentialDecision::Granted((*set).clone()))
            }
            Some(bot) => {
                info!(source = %bot, "credentials withheld from bot-originated session");
                Ok(CredentialDecision::Denied {
                    reason: format!("session source '{bot}' is a bot platform"),
                })
            }
            None => {
                info!("credentials withheld from session with no identified source");
                Ok(CredentialDecision::Denied {
                    reason: "session source is not set".to_owned(),
                })
            }
        }
    }

    /// [`decide`](Self::decide) on the blocking pool, off the async scheduler.
    ///
    /// # Errors
    ///
    /// Returns the load error, or [`CredentialError::Task`] if the blocking
    /// task panicked or was cancelled.
    pub async fn decide_blocking(
        self: &Arc<Self>,
        source: Option<SessionSource>,
        vault_root: PathBuf,
    ) -> Result<CredentialDecision, CredentialError> {
        let gate = Arc::clone(self);
        tokio::task::spawn_blocking(move || gate.decide(source, &vault_root))
            .await
            .map_err(|e| CredentialError::Task(e.to_string()))?
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, CachedSet>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Parse a YAML key/value document into a deny-list-filtered set.
///
/// Scalar values (strings, numbers, booleans) are kept as strings; nested
/// values are skipped with a warning.
///
/// # Errors
///
/// Returns [`CredentialError::Parse`] when the document is not a mapping.
pub fn parse_credentials(path: &Path, contents: &str) -> Result<CredentialSet, CredentialError> {
    let has_content = contents
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with('#'));
    if !has_content {
        return Ok(CredentialSet::empty());
    }

    let mapping: serde_yaml::Mapping =
        serde_yaml::from_str(contents).map_err(|e| CredentialError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let mut vars = BTreeMap::new();
    for (key, value) in mapping {
        let Some(name) = key.as_str().map(str::trim) else {
            warn!(path = %path.display(), "skipping credential with non-string key");
            continue;
        };
        if is_denied(name) {
            debug!(name, "dropping deny-listed credential");
            continue;
        }
        let rendered = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            _ => {
                warn!(name, path = %path.display(), "skipping credential with non-scalar value");
                continue;
            }
        };
        vars.insert(name.to_owned(), rendered);
    }
    Ok(CredentialSet::from_map(vars))
}

/// Ensure a file has private permissions when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path, metadata: &fs::Metadata) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path, _metadata: &fs::Metadata) -> Result<(), CredentialError> {
    Ok(())
}
