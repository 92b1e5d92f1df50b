//! Configuration for a coordination core instance.
//!
//! Loaded from a `lighthouse.toml` file. Parsing is strict: unknown options
//! are rejected at startup (exit code 10), and validation failures are
//! reported before any component is constructed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Data directory holding `log/`, `index/`, `checkpoints/`, and `keys/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Opaque authentication secret shared by the integrity chain, session
    /// tokens, and expert challenges. Must be non-empty to start.
    #[serde(default)]
    pub auth_secret: String,

    /// Maximum concurrent active sessions per agent.
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions_per_agent: u32,

    /// Idle timeout: a session untouched for this long expires.
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Absolute timeout: a session older than this expires regardless of use.
    #[serde(default = "default_absolute_timeout")]
    pub session_absolute_timeout_secs: u64,

    /// Per-agent operations per minute gating `append` and `validate`.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_agent: u32,

    #[serde(default)]
    pub speed_layer: SpeedLayerConfig,

    #[serde(default)]
    pub expert: ExpertConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub shadow_search: ShadowSearchConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            auth_secret: String::new(),
            max_concurrent_sessions_per_agent: default_max_sessions(),
            session_idle_timeout_secs: default_idle_timeout(),
            session_absolute_timeout_secs: default_absolute_timeout(),
            rate_limit_per_agent: default_rate_limit(),
            speed_layer: SpeedLayerConfig::default(),
            expert: ExpertConfig::default(),
            cors: CorsConfig::default(),
            shadow_search: ShadowSearchConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lighthouse")
}

fn default_max_sessions() -> u32 {
    4
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_absolute_timeout() -> u64 {
    12 * 60 * 60
}

fn default_rate_limit() -> u32 {
    120
}

/// Speed layer tier budgets and escalation circuit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeedLayerConfig {
    /// Deadline for the policy tier, in milliseconds.
    #[serde(default = "default_policy_deadline")]
    pub policy_deadline_ms: u64,

    /// Deadline handed to expert escalation, in milliseconds.
    #[serde(default = "default_expert_deadline")]
    pub expert_deadline_ms: u64,

    /// Memory tier capacity (fingerprint → decision entries).
    #[serde(default = "default_memory_capacity")]
    pub memory_cache_capacity: usize,

    /// Escalation failure rate that opens the circuit, in [0, 1].
    #[serde(default = "default_failure_rate")]
    pub circuit_failure_rate: f64,

    /// Cooldown before the open circuit probes again, in milliseconds.
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_ms: u64,
}

impl Default for SpeedLayerConfig {
    fn default() -> Self {
        Self {
            policy_deadline_ms: default_policy_deadline(),
            expert_deadline_ms: default_expert_deadline(),
            memory_cache_capacity: default_memory_capacity(),
            circuit_failure_rate: default_failure_rate(),
            circuit_cooldown_ms: default_circuit_cooldown(),
        }
    }
}

fn default_policy_deadline() -> u64 {
    5
}

fn default_expert_deadline() -> u64 {
    30_000
}

fn default_memory_capacity() -> usize {
    8192
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_circuit_cooldown() -> u64 {
    10_000
}

/// Expert consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpertConfig {
    /// Number of experts per delegation. Must be 1, 3, or 5.
    #[serde(default = "default_consensus_n")]
    pub consensus_n: usize,

    /// Minimum confidence for an approval vote to count.
    #[serde(default = "default_tau_approve")]
    pub tau_approve: f64,

    /// Minimum confidence for a single deny vote to decide the verdict.
    #[serde(default = "default_tau_deny")]
    pub tau_deny: f64,

    /// Safety margin subtracted from the requester's deadline, in milliseconds.
    #[serde(default = "default_safety_margin")]
    pub deadline_safety_margin_ms: u64,

    /// Challenge lifetime for expert registration, in seconds.
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            consensus_n: default_consensus_n(),
            tau_approve: default_tau_approve(),
            tau_deny: default_tau_deny(),
            deadline_safety_margin_ms: default_safety_margin(),
            challenge_ttl_secs: default_challenge_ttl(),
        }
    }
}

fn default_consensus_n() -> usize {
    3
}

fn default_tau_approve() -> f64 {
    0.6
}

fn default_tau_deny() -> f64 {
    0.7
}

fn default_safety_margin() -> u64 {
    250
}

fn default_challenge_ttl() -> u64 {
    120
}

/// Cross-origin policy handed to HTTP adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    /// Explicit origin allow-list.
    #[serde(default)]
    pub allow_origins: Vec<String>,

    /// Whether credentialed requests are allowed for listed origins.
    #[serde(default)]
    pub allow_credentials: bool,
}

/// Shadow search bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowSearchConfig {
    /// Maximum results per search page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ShadowSearchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    50
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions_per_agent == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_sessions_per_agent must be >= 1".to_string(),
            ));
        }
        if self.session_idle_timeout_secs == 0 || self.session_absolute_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "session timeouts must be >= 1 second".to_string(),
            ));
        }
        if self.session_idle_timeout_secs > self.session_absolute_timeout_secs {
            return Err(ConfigError::Validation(
                "session_idle_timeout_secs must not exceed session_absolute_timeout_secs"
                    .to_string(),
            ));
        }
        if !matches!(self.expert.consensus_n, 1 | 3 | 5) {
            return Err(ConfigError::Validation(format!(
                "expert.consensus_n must be 1, 3, or 5 (got {})",
                self.expert.consensus_n
            )));
        }
        for (name, tau) in [
            ("expert.tau_approve", self.expert.tau_approve),
            ("expert.tau_deny", self.expert.tau_deny),
        ] {
            if !(0.0..=1.0).contains(&tau) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be within [0, 1] (got {tau})"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.speed_layer.circuit_failure_rate) {
            return Err(ConfigError::Validation(
                "speed_layer.circuit_failure_rate must be within [0, 1]".to_string(),
            ));
        }
        if self.speed_layer.memory_cache_capacity == 0 {
            return Err(ConfigError::Validation(
                "speed_layer.memory_cache_capacity must be >= 1".to_string(),
            ));
        }
        if self.shadow_search.page_size == 0 {
            return Err(ConfigError::Validation(
                "shadow_search.page_size must be >= 1".to_string(),
            ));
        }
        // Credentialed wildcard origins are forbidden outright.
        if self.cors.allow_credentials && self.cors.allow_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::Validation(
                "cors: wildcard origin with credentials is forbidden".to_string(),
            ));
        }
        Ok(())
    }

    /// The authentication secret, or an error if none is provisioned.
    pub fn auth_secret(&self) -> Result<&[u8], ConfigError> {
        if self.auth_secret.is_empty() {
            return Err(ConfigError::SecretUnavailable);
        }
        Ok(self.auth_secret.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shadow_search.page_size, 50);
        assert_eq!(config.expert.consensus_n, 3);
        assert_eq!(config.max_concurrent_sessions_per_agent, 4);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let raw = r#"
            auth_secret = "s"
            totally_unknown_option = true
        "#;
        let parsed: Result<CoreConfig, _> = toml::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_section_options_are_rejected() {
        let raw = r#"
            [expert]
            consensus_n = 3
            surprise = "yes"
        "#;
        let parsed: Result<CoreConfig, _> = toml::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn consensus_n_must_be_odd_small() {
        let mut config = CoreConfig::default();
        config.expert.consensus_n = 2;
        assert!(config.validate().is_err());
        config.expert.consensus_n = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tau_out_of_range_rejected() {
        let mut config = CoreConfig::default();
        config.expert.tau_deny = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentialed_wildcard_forbidden() {
        let mut config = CoreConfig::default();
        config.cors.allow_origins = vec!["*".to_string()];
        config.cors.allow_credentials = true;
        assert!(config.validate().is_err());

        // Wildcard without credentials is allowed.
        config.cors.allow_credentials = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn idle_timeout_cannot_exceed_absolute() {
        let mut config = CoreConfig::default();
        config.session_idle_timeout_secs = config.session_absolute_timeout_secs + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_secret_is_reported() {
        let config = CoreConfig::default();
        assert!(matches!(
            config.auth_secret(),
            Err(ConfigError::SecretUnavailable)
        ));
    }

    #[test]
    fn parses_full_example() {
        let raw = r#"
            data_dir = "/tmp/lighthouse"
            auth_secret = "topsecret"
            max_concurrent_sessions_per_agent = 2
            session_idle_timeout_secs = 600
            session_absolute_timeout_secs = 3600
            rate_limit_per_agent = 60

            [speed_layer]
            policy_deadline_ms = 5
            expert_deadline_ms = 15000

            [expert]
            consensus_n = 5
            tau_approve = 0.7
            tau_deny = 0.8

            [cors]
            allow_origins = ["https://console.example.com"]
            allow_credentials = true

            [shadow_search]
            page_size = 25
        "#;
        let config: CoreConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.expert.consensus_n, 5);
        assert_eq!(config.shadow_search.page_size, 25);
        assert_eq!(config.auth_secret().unwrap(), b"topsecret");
    }
}
