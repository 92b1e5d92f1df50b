//! Pattern tier: the learned-pattern classifier contract.
//!
//! The classifier itself is externally provided: the core treats it as a
//! pure function from command features to a verdict with confidence, and
//! consults it only after the memory and policy tiers abstain.

use serde::{Deserialize, Serialize};

use crate::speed::TierVerdict;
use crate::speed::fingerprint::CommandRequest;

/// Features extracted from a command for classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFeatures {
    pub token_count: usize,
    pub has_recursive_flag: bool,
    pub has_force_flag: bool,
    pub touches_root: bool,
    pub path_depth: usize,
    /// First token of the command line.
    pub verb: String,
}

impl CommandFeatures {
    /// Extract features from a request.
    #[must_use]
    pub fn extract(request: &CommandRequest) -> Self {
        let line = request.command_line();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let has_flag = |needle: char| {
            tokens
                .iter()
                .any(|t| t.starts_with('-') && !t.starts_with("--") && t.contains(needle))
        };
        let path = request.target_path.as_deref().unwrap_or("");
        Self {
            token_count: tokens.len(),
            has_recursive_flag: has_flag('r') || tokens.contains(&"--recursive"),
            has_force_flag: has_flag('f') || tokens.contains(&"--force"),
            touches_root: tokens.iter().any(|t| *t == "/") || path == "/",
            path_depth: path.split('/').filter(|s| !s.is_empty()).count(),
            verb: tokens.first().unwrap_or(&"").to_string(),
        }
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternVerdict {
    pub verdict: TierVerdict,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl PatternVerdict {
    /// An abstention with zero confidence.
    #[must_use]
    pub const fn abstain() -> Self {
        Self {
            verdict: TierVerdict::Abstain,
            confidence: 0.0,
        }
    }
}

/// The calling contract for externally provided classifiers.
pub trait PatternClassifier: Send + Sync {
    /// Classify a command from its features. Must be pure and fast.
    fn classify(&self, features: &CommandFeatures) -> PatternVerdict;
}

/// Default classifier: always abstains, pushing unknowns to escalation.
#[derive(Debug, Default)]
pub struct NullClassifier;

impl PatternClassifier for NullClassifier {
    fn classify(&self, _features: &CommandFeatures) -> PatternVerdict {
        PatternVerdict::abstain()
    }
}
