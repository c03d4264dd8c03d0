use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use streams_core::{Result, StreamsError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub pricing: PricingSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the stream service, e.g. "http://localhost:4100".
    pub base_url: String,
    #[serde(default = "default_history_path")]
    pub history_path: String,
}

impl ServerSettings {
    /// URL of the global session-history stream.
    pub fn history_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.history_path
        )
    }

    /// URL of the conversation stream for one session.
    pub fn conversation_url(&self, session_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), session_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSettings {
    #[serde(default = "default_pricing_url")]
    pub dataset_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_recent_sessions")]
    pub recent_sessions: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySettings {
    /// First reconnect delay after a transport error, in milliseconds.
    #[serde(default = "default_retry_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for the reconnect backoff, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

impl ViewerConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StreamsError::ConfigError(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: ViewerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| StreamsError::ConfigError(format!("Failed to parse YAML: {}", e)))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(base_url) = env::var("STREAMS_SERVER_URL") {
            self.server.base_url = base_url;
        }
        if let Ok(url) = env::var("STREAMS_PRICING_URL") {
            self.pricing.dataset_url = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            return Err(StreamsError::ConfigError(
                "Server base_url cannot be empty".into(),
            ));
        }
        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            return Err(StreamsError::ConfigError(
                "Server base_url must start with http:// or https://".into(),
            ));
        }
        if self.limits.recent_sessions == 0 {
            return Err(StreamsError::ConfigError(
                "recent_sessions must be greater than zero".into(),
            ));
        }
        if self.retry.initial_ms == 0 || self.retry.max_ms < self.retry.initial_ms {
            return Err(StreamsError::ConfigError(
                "retry backoff bounds must satisfy 0 < initial_ms <= max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        let home_dir = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home_dir)
            .join(".claude-streams")
            .join("viewer.yaml")
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            pricing: PricingSettings::default(),
            limits: LimitSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4100".to_string(),
            history_path: default_history_path(),
        }
    }
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            dataset_url: default_pricing_url(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            recent_sessions: default_recent_sessions(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_ms: default_retry_initial_ms(),
            max_ms: default_retry_max_ms(),
        }
    }
}

fn default_history_path() -> String {
    "_history".to_string()
}

fn default_pricing_url() -> String {
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json"
        .to_string()
}

fn default_recent_sessions() -> usize {
    100
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}
