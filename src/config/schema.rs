use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub dingtalk: DingTalkConfig,
    pub model: ModelConfig,
    pub history: HistoryConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DingTalkConfig {
    /// Secrets Manager secret holding `{"AppKey", "AppSecret"}`.
    pub secret_name: String,
    pub secret_region: String,
    /// Set both to skip the Secrets Manager lookup.
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub api_base: String,
    /// How long the gateway waits for a handler before acking anyway.
    pub ack_deadline_secs: u64,
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            secret_name: "dingtalk_app_credential".into(),
            secret_region: crate::aws::DEFAULT_REGION.into(),
            app_key: None,
            app_secret: None,
            api_base: crate::channels::dingtalk::DEFAULT_API_BASE.into(),
            ack_deadline_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub model_id: String,
    /// Falls back to `AWS_REGION`, then `us-west-2`.
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "anthropic.claude-v1".into(),
            region: None,
            endpoint: None,
            max_tokens: 2048,
            temperature: 0.5,
            top_p: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackendKind {
    #[default]
    Dynamodb,
    Sqlite,
    Memory,
}

impl HistoryBackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dynamodb" | "ddb" => Some(Self::Dynamodb),
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub backend: HistoryBackendKind,
    pub table_name: String,
    pub primary_key: String,
    /// Remembered turns; each turn is a request and a response record.
    pub turn_count: usize,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub sqlite_dir: PathBuf,
    /// 64 hex chars. When set, new entries are written sealed.
    pub encryption_key: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackendKind::Dynamodb,
            table_name: "chatbot_conversation_table".into(),
            primary_key: crate::history::dynamodb::DEFAULT_PRIMARY_KEY.into(),
            turn_count: 10,
            region: None,
            endpoint: None,
            sqlite_dir: PathBuf::from("data"),
            encryption_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Concurrent handlers. Defaults to the number of available cores.
    pub workers: Option<usize>,
    pub flush_every: usize,
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            flush_every: crate::reply::DEFAULT_FLUSH_EVERY,
            queue_capacity: 64,
        }
    }
}
