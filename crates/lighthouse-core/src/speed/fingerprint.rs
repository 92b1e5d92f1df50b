//! Command fingerprinting.
//!
//! A fingerprint is a stable hash over the command's semantic shape: kind,
//! normalized arguments, target path, and the caller's role. Identical shapes
//! hit the same cache entry and coalesce into a single escalation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::Role;

/// A command submitted for validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command kind, e.g. `rm -rf /` or `refactor module X`.
    pub kind: String,
    /// Additional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Target path when the command addresses one.
    #[serde(default)]
    pub target_path: Option<String>,
}

impl CommandRequest {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: Vec::new(),
            target_path: None,
        }
    }

    /// The full command line the policy engine matches against.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = normalize(&self.kind);
        for arg in &self.args {
            let arg = normalize(arg);
            if !arg.is_empty() {
                line.push(' ');
                line.push_str(&arg);
            }
        }
        line
    }
}

/// Stable content-addressed fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse runs of whitespace and trim the ends.
fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compute the fingerprint for a command as issued by a caller role.
#[must_use]
pub fn fingerprint(request: &CommandRequest, caller_role: Role) -> Fingerprint {
    let mut parts = Vec::with_capacity(4 + request.args.len());
    parts.push(format!("kind={}", normalize(&request.kind)));
    for (i, arg) in request.args.iter().enumerate() {
        parts.push(format!("arg[{i}]={}", normalize(arg)));
    }
    parts.push(format!(
        "path={}",
        request.target_path.as_deref().map(normalize).unwrap_or_default()
    ));
    parts.push(format!("role={}", caller_role.as_str()));
    let canonical = parts.join("|");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    Fingerprint(format!("sha256:{}", &hex::encode(digest)[..32]))
}
