//! Layered configuration: typed defaults, an optional TOML file, then the
//! environment variables the deployed container is started with.

pub mod schema;

pub use schema::{
    Config, DingTalkConfig, HistoryBackendKind, HistoryConfig, ModelConfig, RuntimeConfig,
};

use anyhow::Context;
use std::path::Path;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name}={value:?} is invalid: {reason}")]
    Env {
        name: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn env_error(name: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl Config {
    /// Defaults, overlaid by `path` when given, then by the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                tracing::info!(path = %path.display(), "Loaded config file");
                config
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::apply_env_overrides`] with an explicit lookup, so tests
    /// do not touch the process environment.
    pub fn apply_env_overrides_from<F>(&mut self, mut env: F) -> Result<(), ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(model_id) = get("BEDROCK_MODEL_ID") {
            self.model.model_id = model_id;
        }
        if let Some(table) = get("DDB_TABLE_NAME") {
            self.history.table_name = table;
        }
        if let Some(raw) = get("INPUT_HISTORY_CONVERSATION_COUNT") {
            self.history.turn_count = raw
                .parse()
                .map_err(|e| env_error("INPUT_HISTORY_CONVERSATION_COUNT", &raw, e))?;
        }
        if let Some(secret) = get("DINGTALK_SETTING") {
            self.dingtalk.secret_name = secret;
        }
        if let Some(region) = get("DINGTALK_SETTING_REGION") {
            self.dingtalk.secret_region = region;
        }
        if let Some(key) = get("DINGTALK_APP_KEY") {
            self.dingtalk.app_key = Some(key);
        }
        if let Some(secret) = get("DINGTALK_APP_SECRET") {
            self.dingtalk.app_secret = Some(secret);
        }
        if let Some(raw) = get("DINGBOT_HISTORY_BACKEND") {
            self.history.backend = HistoryBackendKind::parse(&raw).ok_or_else(|| {
                env_error("DINGBOT_HISTORY_BACKEND", &raw, "expected dynamodb, sqlite or memory")
            })?;
        }
        if let Some(key) = get("DINGBOT_HISTORY_KEY") {
            self.history.encryption_key = Some(key);
        }
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            if self.model.region.is_none() {
                self.model.region = Some(region.clone());
            }
            if self.history.region.is_none() {
                self.history.region = Some(region);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.turn_count == 0 {
            return Err(ConfigError::Invalid(
                "history.turn_count must be greater than 0".into(),
            ));
        }
        if self.history.turn_count.checked_mul(2).is_none() {
            return Err(ConfigError::Invalid(format!(
                "history.turn_count {} is too large",
                self.history.turn_count
            )));
        }
        if self.runtime.flush_every == 0 {
            return Err(ConfigError::Invalid(
                "runtime.flush_every must be greater than 0".into(),
            ));
        }
        if self.runtime.workers == Some(0) {
            return Err(ConfigError::Invalid("runtime.workers must be at least 1".into()));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "runtime.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.model.model_id.trim().is_empty() {
            return Err(ConfigError::Invalid("model.model_id is empty".into()));
        }
        if self.history.table_name.trim().is_empty() {
            return Err(ConfigError::Invalid("history.table_name is empty".into()));
        }
        if let Some(key) = &self.history.encryption_key {
            let valid = key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::Invalid(
                    "history.encryption_key must be 64 hex characters".into(),
                ));
            }
        }
        if self.dingtalk.app_key.is_some() != self.dingtalk.app_secret.is_some() {
            return Err(ConfigError::Invalid(
                "dingtalk.app_key and dingtalk.app_secret must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Stored messages fed back as context: two per remembered turn.
    pub fn history_limit(&self) -> usize {
        self.history.turn_count.saturating_mul(2)
    }

    pub fn model_region(&self) -> String {
        self.model
            .region
            .clone()
            .unwrap_or_else(|| crate::aws::DEFAULT_REGION.to_string())
    }

    pub fn history_region(&self) -> String {
        self.history
            .region
            .clone()
            .unwrap_or_else(|| crate::aws::DEFAULT_REGION.to_string())
    }

    pub fn worker_count(&self) -> usize {
        self.runtime.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
