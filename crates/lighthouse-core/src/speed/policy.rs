//! Policy tier: a compiled rule set evaluated against the command line.
//!
//! Rules are compiled once at load time: regexes built, priorities assigned
//! by position, and an Aho-Corasick keyword scan in front so the common
//! benign command exits in one pass without touching a regex. Evaluation
//! order is the load order; the first matching rule wins.

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SpeedError;
use crate::identity::Role;
use crate::speed::TierVerdict;
use crate::speed::fingerprint::CommandRequest;

/// What a matched rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Deny,
    Escalate,
}

/// A declarative rule before compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Stable id surfaced in decisions and logs.
    pub id: String,
    /// Regex matched against the normalized command line.
    pub pattern: String,
    /// Literal keywords gating evaluation. Empty = always evaluated.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub action: RuleAction,
    /// Restrict to specific caller roles. Empty = all roles.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Reason attached to the decision.
    pub reason: String,
}

struct CompiledRule {
    id: String,
    pattern: Regex,
    keyword_indices: Vec<usize>,
    action: RuleAction,
    roles: Vec<Role>,
    reason: String,
}

/// A rule match returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub rule_id: String,
    pub verdict: TierVerdict,
    pub reason: String,
}

/// Compiled policy engine.
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    prefilter: Option<AhoCorasick>,
}

impl PolicyEngine {
    /// Compile a rule set. Patterns and keywords are prepared here so the
    /// per-request path never builds or sorts anything.
    pub fn new(specs: Vec<RuleSpec>) -> Result<Self, SpeedError> {
        let mut rules = Vec::with_capacity(specs.len());
        let mut keywords = Vec::new();

        for spec in specs {
            let pattern = Regex::new(&spec.pattern).map_err(|e| SpeedError::InvalidRule {
                rule_id: spec.id.clone(),
                reason: e.to_string(),
            })?;
            let mut keyword_indices = Vec::with_capacity(spec.keywords.len());
            for keyword in &spec.keywords {
                keyword_indices.push(keywords.len());
                keywords.push(keyword.to_ascii_lowercase());
            }
            rules.push(CompiledRule {
                id: spec.id,
                pattern,
                keyword_indices,
                action: spec.action,
                roles: spec.roles,
                reason: spec.reason,
            });
        }

        let prefilter = if keywords.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&keywords).map_err(|e| SpeedError::InvalidRule {
                    rule_id: "keyword prefilter".to_string(),
                    reason: e.to_string(),
                })?,
            )
        };

        Ok(Self { rules, prefilter })
    }

    /// The built-in rule set.
    #[must_use]
    pub fn builtin_rules() -> Vec<RuleSpec> {
        vec![
            RuleSpec {
                id: "deny.rm_root".to_string(),
                pattern: r"(^|\s)rm\s+-\w*r\w*\s+/\s*$".to_string(),
                keywords: vec!["rm".to_string()],
                action: RuleAction::Deny,
                roles: vec![],
                reason: "recursive delete of the filesystem root".to_string(),
            },
            RuleSpec {
                id: "deny.mkfs".to_string(),
                pattern: r"(^|\s)mkfs(\.\w+)?\s".to_string(),
                keywords: vec!["mkfs".to_string()],
                action: RuleAction::Deny,
                roles: vec![],
                reason: "filesystem format".to_string(),
            },
            RuleSpec {
                id: "deny.dd_device".to_string(),
                pattern: r"(^|\s)dd\s.*\bof=/dev/".to_string(),
                keywords: vec!["dd".to_string()],
                action: RuleAction::Deny,
                roles: vec![],
                reason: "raw write to a block device".to_string(),
            },
            RuleSpec {
                id: "deny.force_push".to_string(),
                pattern: r"(^|\s)git\s+push\s+.*(--force|-f)(\s|$)".to_string(),
                keywords: vec!["push".to_string()],
                action: RuleAction::Deny,
                roles: vec![],
                reason: "history rewrite on a shared remote".to_string(),
            },
            RuleSpec {
                id: "approve.read_only".to_string(),
                pattern: r"^(ls|cat|head|tail|wc|stat|git\s+(status|log|diff|show))(\s|$)"
                    .to_string(),
                keywords: vec![
                    "ls".to_string(),
                    "cat".to_string(),
                    "head".to_string(),
                    "tail".to_string(),
                    "wc".to_string(),
                    "stat".to_string(),
                    "git".to_string(),
                ],
                action: RuleAction::Approve,
                roles: vec![],
                reason: "read-only inspection".to_string(),
            },
            RuleSpec {
                id: "escalate.refactor".to_string(),
                pattern: r"^refactor\s".to_string(),
                keywords: vec!["refactor".to_string()],
                action: RuleAction::Escalate,
                roles: vec![],
                reason: "structural change needs expert review".to_string(),
            },
            RuleSpec {
                id: "escalate.delete_tree".to_string(),
                pattern: r"(^|\s)rm\s+-\w*r".to_string(),
                keywords: vec!["rm".to_string()],
                action: RuleAction::Escalate,
                roles: vec![],
                reason: "recursive delete".to_string(),
            },
        ]
    }

    /// Evaluate a command. Returns the first matching rule or `None` when
    /// the policy tier abstains.
    #[must_use]
    pub fn evaluate(&self, request: &CommandRequest, caller_role: Role) -> Option<PolicyMatch> {
        let line = request.command_line().to_ascii_lowercase();

        // Keyword pre-scan: collect which keyword indices fired.
        let mut fired = vec![false; self.prefilter.as_ref().map_or(0, |p| p.patterns_len())];
        if let Some(prefilter) = &self.prefilter {
            for hit in prefilter.find_iter(&line) {
                fired[hit.pattern().as_usize()] = true;
            }
        }

        for rule in &self.rules {
            // Rules with no keywords are always evaluated.
            if !rule.keyword_indices.is_empty()
                && !rule.keyword_indices.iter().any(|i| fired[*i])
            {
                continue;
            }
            if !rule.roles.is_empty() && !rule.roles.contains(&caller_role) {
                continue;
            }
            if rule.pattern.is_match(&line) {
                let verdict = match rule.action {
                    RuleAction::Approve => TierVerdict::Approve,
                    RuleAction::Deny => TierVerdict::Deny,
                    RuleAction::Escalate => TierVerdict::Escalate,
                };
                return Some(PolicyMatch {
                    rule_id: rule.id.clone(),
                    verdict,
                    reason: rule.reason.clone(),
                });
            }
        }
        None
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
