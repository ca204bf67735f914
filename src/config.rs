//! Layered runtime configuration (`spec.md` §6, `SPEC_FULL.md` §4.11).
//!
//! Load order, lowest to highest precedence: hardcoded defaults, an
//! optional YAML file (`SERAPH_CONFIG`, default `./seraph.yaml`), then
//! `SERAPH_*` environment variable overrides. Invalid configuration fails
//! fast at startup rather than falling back silently, matching the
//! teacher's `Config`/`ConfigError` pattern.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::priority::KeywordRules;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub port: u16,
    pub bind_address: String,
    pub workers: usize,
    #[serde(skip_serializing)]
    pub server_api_key: Option<String>,
    pub llm: LlmConfig,
    pub alert_manager: AlertManagerConfig,
    pub priority_queue: PriorityQueueConfig,
    pub llm_cache: LlmCacheConfig,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "127.0.0.1".into(),
            workers: 4,
            server_api_key: None,
            llm: LlmConfig::default(),
            alert_manager: AlertManagerConfig::default(),
            priority_queue: PriorityQueueConfig::default(),
            llm_cache: LlmCacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertManagerConfig {
    pub url: String,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self { url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub preemption_enabled: bool,
    pub preemption_threshold: f64,
    pub max_preemptions: u32,
    pub burst_mode_enabled: bool,
    pub burst_concurrent: usize,
    pub burst_max_duration_seconds: u64,
    pub priority_weights: PriorityWeightsConfig,
    pub services: Vec<ServiceConfig>,
    pub business_hours: BusinessHoursConfig,
    pub critical_keywords: Vec<String>,
    pub high_priority_keywords: Vec<String>,
    pub medium_priority_keywords: Vec<String>,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
            max_queue_size: 1000,
            preemption_enabled: true,
            preemption_threshold: 0.3,
            max_preemptions: 2,
            burst_mode_enabled: true,
            burst_concurrent: 8,
            burst_max_duration_seconds: 600,
            priority_weights: PriorityWeightsConfig::default(),
            services: Vec::new(),
            business_hours: BusinessHoursConfig::default(),
            critical_keywords: Vec::new(),
            high_priority_keywords: Vec::new(),
            medium_priority_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeightsConfig {
    pub keywords: f64,
    pub service_impact: f64,
    pub time_context: f64,
    pub historical: f64,
}

impl Default for PriorityWeightsConfig {
    fn default() -> Self {
        Self { keywords: 0.3, service_impact: 0.4, time_context: 0.2, historical: 0.1 }
    }
}

impl PriorityWeightsConfig {
    fn sum(&self) -> f64 {
        self.keywords + self.service_impact + self.time_context + self.historical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub criticality: String,
    pub user_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessHoursConfig {
    pub start: u32,
    pub end: u32,
    pub timezone: String,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self { start: 9, end: 17, timezone: "UTC".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCacheConfig {
    pub similarity_threshold: f64,
    pub ttl_seconds: u64,
}

impl Default for LlmCacheConfig {
    fn default() -> Self {
        Self { similarity_threshold: 0.95, ttl_seconds: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), format: "text".into() }
    }
}

const COMPLEXITY_BUDGET_CHARS: usize = 200;

impl RuntimeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("SERAPH_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => match Self::from_file("./seraph.yaml") {
                Ok(config) => config,
                Err(ConfigError::Io { .. }) => Self::default(),
                Err(other) => return Err(other),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("SERAPH_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SERAPH_PORT".into(),
                reason: "must be a valid port number".into(),
            })?;
        }
        if let Ok(host) = env::var("SERAPH_BIND_ADDRESS") {
            self.bind_address = host;
        }
        if let Ok(key) = env::var("SERAPH_API_KEY") {
            self.server_api_key = Some(key);
        }
        if let Ok(max_concurrent) = env::var("SERAPH_MAX_CONCURRENT") {
            self.priority_queue.max_concurrent =
                max_concurrent.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "SERAPH_MAX_CONCURRENT".into(),
                    reason: "must be a positive integer".into(),
                })?;
        }
        if let Ok(url) = env::var("SERAPH_ALERTMANAGER_URL") {
            self.alert_manager.url = url;
        }
        if let Ok(level) = env::var("SERAPH_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue { key: "port".into(), reason: "cannot be 0".into() });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let weight_sum = self.priority_queue.priority_weights.sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(ConfigError::InvalidValue {
                key: "priorityQueue.priorityWeights".into(),
                reason: format!("weights must sum to ~1.0, got {weight_sum}"),
            });
        }

        if self.priority_queue.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "priorityQueue.maxConcurrent".into(),
                reason: "must be > 0".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.llm_cache.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "llmCache.similarityThreshold".into(),
                reason: "must be between 0.0 and 1.0".into(),
            });
        }

        for pattern in self
            .priority_queue
            .critical_keywords
            .iter()
            .chain(&self.priority_queue.high_priority_keywords)
            .chain(&self.priority_queue.medium_priority_keywords)
        {
            if pattern.len() > COMPLEXITY_BUDGET_CHARS {
                return Err(ConfigError::UnsafeRegex { pattern: pattern.clone() });
            }
        }
        // KeywordRules::compile rejects nested-quantifier patterns and
        // invalid regex syntax; run it once over the full configured sets
        // so a bad pattern fails fast at startup rather than at first log.
        KeywordRules::compile(
            &self.priority_queue.critical_keywords,
            &self.priority_queue.high_priority_keywords,
            &self.priority_queue.medium_priority_keywords,
        )?;

        Ok(())
    }

    pub fn get_server_api_key(&self) -> Result<String, ConfigError> {
        self.server_api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired { key: "serverApiKey".into() })
    }
}

/// Startup prompts and arbitrary sink-specific backend tags that don't fit
/// a fixed schema; carried through so operators can template additional
/// metadata without a config schema change.
pub type ExtraTags = HashMap<String, String>;
