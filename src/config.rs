use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PersonaError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PersonaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub nodes: NodeConfig,
    pub decay: DecayConfig,
    pub retrieval: RetrievalConfig,
    pub policy: PolicyConfig,
    pub analysis: AnalysisConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `"sqlite"` (one file per store) or `"memory"` (ephemeral).
    pub backend: String,
    pub db_path: String,
    pub graph_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Processed/dropped entries kept per conversation as reply context.
    pub history_size: usize,
    /// Pending entries per conversation before enqueue reports backpressure.
    pub pending_capacity: usize,
    /// Entries handed to one analysis call.
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    pub initial_activation: f64,
    pub activation_boost: f64,
    pub max_activation: f64,
    /// Strength added per co-occurrence, before saturation.
    pub association_delta: f64,
    pub max_strength: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DecayConfig {
    pub enabled: bool,
    /// Rates are per hour: `value * exp(-rate * hours)`.
    pub memory_rate_per_hour: f64,
    pub node_rate_per_hour: f64,
    pub association_rate_per_hour: f64,
    pub memory_floor: f64,
    pub node_floor: f64,
    pub association_floor: f64,
    pub max_nodes_per_conversation: usize,
    pub max_memories_per_conversation: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub importance_weight: f64,
    pub recency_weight: f64,
    pub match_weight: f64,
    pub recency_half_life_hours: f64,
    /// Outgoing edges followed per seed node during graph expansion.
    pub expansion_fanout: usize,
    /// Search the shared (public) graph alongside the conversation's own.
    pub include_shared: bool,
    pub max_activation: f64,
    /// Weight added to a memory when it is retrieved and used.
    pub reinforce_boost: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    pub reply_threshold: f64,
    pub topic_weight: f64,
    pub continuation_weight: f64,
    pub cooldown_minutes: f64,
    /// Nodes considered "active" when measuring topic similarity.
    pub active_node_count: usize,
    pub history_for_reply: usize,
    pub fallback_reply: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub decay_interval_secs: u64,
    pub batch_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_persona_dir();
        Self {
            backend: "sqlite".into(),
            db_path: dir.join("persona.db").to_string_lossy().into_owned(),
            graph_path: dir.join("graph.db").to_string_lossy().into_owned(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_size: 40,
            pending_capacity: 200,
            batch_size: 80,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            initial_activation: 1.0,
            activation_boost: 0.3,
            max_activation: 5.0,
            association_delta: 0.3,
            max_strength: 1.0,
        }
    }
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_rate_per_hour: 0.005,
            node_rate_per_hour: 0.01,
            association_rate_per_hour: 0.01,
            memory_floor: 0.01,
            node_floor: 0.05,
            association_floor: 0.001,
            max_nodes_per_conversation: 1000,
            max_memories_per_conversation: 500,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            importance_weight: 0.5,
            recency_weight: 0.2,
            match_weight: 0.3,
            recency_half_life_hours: 72.0,
            expansion_fanout: 4,
            include_shared: true,
            max_activation: 5.0,
            reinforce_boost: 0.1,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reply_threshold: 0.45,
            topic_weight: 0.6,
            continuation_weight: 0.4,
            cooldown_minutes: 10.0,
            active_node_count: 20,
            history_for_reply: 40,
            fallback_reply: "I don't remember.".into(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.3,
            timeout_secs: 60,
            max_attempts: 3,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decay_interval_secs: 3600,
            batch_interval_secs: 3600,
        }
    }
}

/// Returns `~/.persona/`
pub fn default_persona_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".persona")
}

/// Returns the default config file path: `~/.persona/config.toml`
pub fn default_config_path() -> PathBuf {
    default_persona_dir().join("config.toml")
}

impl PersonaConfig {
    /// Load config from TOML file (if it exists), apply env var overrides, validate.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            PersonaConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PERSONA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("PERSONA_GRAPH_DB") {
            self.storage.graph_path = val;
        }
        if let Ok(val) = std::env::var("PERSONA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("PERSONA_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY")) {
            self.analysis.api_key = val;
        }
        if let Ok(val) = std::env::var("PERSONA_BASE_URL").or_else(|_| std::env::var("OPENAI_BASE_URL")) {
            self.analysis.base_url = val;
        }
        if let Ok(val) = std::env::var("PERSONA_MODEL") {
            self.analysis.model = val;
        }
    }

    /// Reject values that would make decay, retrieval or the queue misbehave.
    pub fn validate(&self) -> Result<(), PersonaError> {
        let d = &self.decay;
        for (name, rate) in [
            ("decay.memory_rate_per_hour", d.memory_rate_per_hour),
            ("decay.node_rate_per_hour", d.node_rate_per_hour),
            ("decay.association_rate_per_hour", d.association_rate_per_hour),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(PersonaError::Config(format!(
                    "{name} must be a finite non-negative number, got {rate}"
                )));
            }
        }
        for (name, floor) in [
            ("decay.memory_floor", d.memory_floor),
            ("decay.node_floor", d.node_floor),
            ("decay.association_floor", d.association_floor),
        ] {
            if !(0.0..1.0).contains(&floor) {
                return Err(PersonaError::Config(format!(
                    "{name} must be in [0, 1), got {floor}"
                )));
            }
        }

        let n = &self.nodes;
        if !n.initial_activation.is_finite()
            || !n.max_activation.is_finite()
            || n.initial_activation <= 0.0
            || n.max_activation < n.initial_activation
        {
            return Err(PersonaError::Config(
                "nodes.max_activation must be >= nodes.initial_activation > 0".into(),
            ));
        }
        if !(n.activation_boost >= 0.0 && n.association_delta > 0.0 && n.max_strength > 0.0)
            || [n.activation_boost, n.association_delta, n.max_strength]
                .iter()
                .any(|v| !v.is_finite())
        {
            return Err(PersonaError::Config(
                "nodes.activation_boost must be >= 0; association_delta and max_strength must be > 0"
                    .into(),
            ));
        }

        let r = &self.retrieval;
        if [r.importance_weight, r.recency_weight, r.match_weight]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(PersonaError::Config(
                "retrieval weights must be non-negative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.reinforce_boost) {
            return Err(PersonaError::Config(format!(
                "retrieval.reinforce_boost must be in [0, 1], got {}",
                r.reinforce_boost
            )));
        }
        if r.recency_half_life_hours <= 0.0 || r.max_activation <= 0.0 {
            return Err(PersonaError::Config(
                "retrieval.recency_half_life_hours and retrieval.max_activation must be > 0".into(),
            ));
        }
        if r.max_activation != n.max_activation {
            return Err(PersonaError::Config(format!(
                "retrieval.max_activation ({}) must equal nodes.max_activation ({})",
                r.max_activation, n.max_activation
            )));
        }

        let p = &self.policy;
        if [p.reply_threshold, p.topic_weight, p.continuation_weight, p.cooldown_minutes]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(PersonaError::Config(
                "policy thresholds and weights must be non-negative".into(),
            ));
        }

        let q = &self.queue;
        if q.history_size == 0 || q.pending_capacity == 0 || q.batch_size == 0 {
            return Err(PersonaError::Config(
                "queue.history_size, pending_capacity and batch_size must be > 0".into(),
            ));
        }

        if self.analysis.timeout_secs == 0 || self.analysis.max_attempts == 0 {
            return Err(PersonaError::Config(
                "analysis.timeout_secs and analysis.max_attempts must be > 0".into(),
            ));
        }
        if self.scheduler.decay_interval_secs == 0 || self.scheduler.batch_interval_secs == 0 {
            return Err(PersonaError::Config(
                "scheduler intervals must be > 0".into(),
            ));
        }

        match self.storage.backend.as_str() {
            "sqlite" | "memory" => Ok(()),
            other => Err(PersonaError::Config(format!(
                "unknown storage backend: {other}. Supported: sqlite, memory"
            ))),
        }
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_graph_path(&self) -> PathBuf {
        expand_tilde(&self.storage.graph_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PersonaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.queue.history_size, 40);
        assert_eq!(config.nodes.activation_boost, 0.3);
        assert!(config.storage.db_path.ends_with("persona.db"));
        assert!(config.storage.graph_path.ends_with("graph.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
backend = "memory"

[decay]
memory_rate_per_hour = 0.2
"#;
        let config: PersonaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.decay.memory_rate_per_hour, 0.2);
        // defaults still apply for unset fields
        assert_eq!(config.decay.memory_floor, 0.01);
        config.validate().unwrap();
    }

    #[test]
    fn negative_decay_rate_rejected() {
        let mut config = PersonaConfig::default();
        config.decay.node_rate_per_hour = -0.1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("node_rate_per_hour"));
    }

    #[test]
    fn negative_threshold_rejected() {
        let mut config = PersonaConfig::default();
        config.policy.reply_threshold = -1.0;
        assert!(matches!(config.validate(), Err(PersonaError::Config(_))));
    }

    #[test]
    fn nan_policy_and_boost_rejected() {
        let mut config = PersonaConfig::default();
        config.policy.reply_threshold = f64::NAN;
        assert!(matches!(config.validate(), Err(PersonaError::Config(_))));

        let mut config = PersonaConfig::default();
        config.nodes.activation_boost = f64::NAN;
        assert!(matches!(config.validate(), Err(PersonaError::Config(_))));

        let mut config = PersonaConfig::default();
        config.nodes.initial_activation = f64::INFINITY;
        assert!(matches!(config.validate(), Err(PersonaError::Config(_))));
    }

    #[test]
    fn mismatched_activation_ceilings_rejected() {
        let mut config = PersonaConfig::default();
        config.nodes.max_activation = 10.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retrieval.max_activation"));

        config.retrieval.max_activation = 10.0;
        config.validate().unwrap();
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = PersonaConfig::default();
        config.storage.backend = "postgres".into();
        assert!(config.validate().unwrap_err().to_string().contains("postgres"));
    }

    #[test]
    fn invalid_file_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[decay]\nmemory_floor = 1.5\n").unwrap();
        assert!(PersonaConfig::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = PersonaConfig::default();
        std::env::set_var("PERSONA_DB", "/tmp/override.db");
        std::env::set_var("PERSONA_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");

        std::env::remove_var("PERSONA_DB");
        std::env::remove_var("PERSONA_LOG_LEVEL");
    }
}
