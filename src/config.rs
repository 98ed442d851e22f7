//! Configuration management for Chatflow
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::billing::{PlanTier, QuotaLimit};
use crate::error::{ChatflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Chatflow
///
/// This structure holds all configuration needed for the chat pipeline,
/// including provider settings, quota limits, and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Provider configuration
    pub provider: ProviderConfig,
    /// Chat pipeline behavior
    #[serde(default)]
    pub chat: ChatConfig,
    /// Per-tier usage limits
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Session list grouping
    #[serde(default)]
    pub grouping: GroupingConfig,
    /// Session database location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local caller identity
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Provider configuration
///
/// Specifies which AI provider to use and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Type of provider to use
    #[serde(rename = "type")]
    pub provider_type: String,

    /// OpenAI-compatible provider configuration
    #[serde(default)]
    pub openai: OpenAiConfig,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Base URL of the API (useful for tests and self-hosted gateways)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Name of the environment variable that holds the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for chat responses
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Model used for title summarization
    #[serde(default = "default_title_model")]
    pub title_model: String,

    /// Timeout applied to non-streaming requests (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_title_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            model: default_openai_model(),
            title_model: default_title_model(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Chat pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Number of most recent messages sent to the provider as context
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Abort the stream when no chunk arrives within this window (seconds)
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_seconds: u64,

    /// Extra attempts made when persisting a finalized turn fails
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    /// Placeholder name prefix for new sessions
    #[serde(default = "default_session_name")]
    pub default_session_name: String,
}

fn default_max_history_messages() -> usize {
    100
}

fn default_stream_idle_timeout() -> u64 {
    45
}

fn default_persist_retries() -> u32 {
    2
}

fn default_session_name() -> String {
    "Untitled Chat".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history_messages: default_max_history_messages(),
            stream_idle_timeout_seconds: default_stream_idle_timeout(),
            persist_retries: default_persist_retries(),
            default_session_name: default_session_name(),
        }
    }
}

/// Usage limits per subscription tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Limits for the free tier
    #[serde(default = "default_free_limit")]
    pub free: QuotaLimit,

    /// Limits for the pro tier
    #[serde(default = "default_pro_limit")]
    pub pro: QuotaLimit,
}

fn default_free_limit() -> QuotaLimit {
    QuotaLimit {
        monthly_limit: 100,
        daily_limit: Some(20),
    }
}

fn default_pro_limit() -> QuotaLimit {
    QuotaLimit {
        monthly_limit: 1500,
        daily_limit: None,
    }
}

impl QuotaConfig {
    /// Resolve the limits that apply to a plan tier
    ///
    /// # Examples
    ///
    /// ```
    /// use chatflow::billing::PlanTier;
    /// use chatflow::config::QuotaConfig;
    ///
    /// let quota = QuotaConfig::default();
    /// assert_eq!(quota.limit_for(PlanTier::Free).daily_limit, Some(20));
    /// assert_eq!(quota.limit_for(PlanTier::Pro).daily_limit, None);
    /// ```
    pub fn limit_for(&self, plan: PlanTier) -> QuotaLimit {
        match plan {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: default_free_limit(),
            pro: default_pro_limit(),
        }
    }
}

/// First day of the week used by the "This Week" bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeekStart {
    /// Weeks begin on Sunday
    #[default]
    Sunday,
    /// Weeks begin on Monday (ISO 8601)
    Monday,
}

/// Session list grouping configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupingConfig {
    /// First day of the week
    #[serde(default)]
    pub week_start: WeekStart,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Explicit SQLite database path; the platform data directory is used when unset
    #[serde(default)]
    pub path: Option<String>,
}

/// Identity of the local CLI caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Owner id stamped on sessions and quota records
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
}

fn default_owner_id() -> String {
    "local".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default_config()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn default_config() -> Self {
        Self {
            provider: ProviderConfig {
                provider_type: "openai".to_string(),
                openai: OpenAiConfig::default(),
            },
            chat: ChatConfig::default(),
            quota: QuotaConfig::default(),
            grouping: GroupingConfig::default(),
            storage: StorageConfig::default(),
            identity: IdentityConfig::default(),
        }
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatflowError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChatflowError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(provider_type) = std::env::var("CHATFLOW_PROVIDER") {
            self.provider.provider_type = provider_type;
        }

        if let Ok(api_base) = std::env::var("CHATFLOW_OPENAI_API_BASE") {
            self.provider.openai.api_base = api_base;
        }

        if let Ok(model) = std::env::var("CHATFLOW_OPENAI_MODEL") {
            self.provider.openai.model = model;
        }

        if let Ok(title_model) = std::env::var("CHATFLOW_TITLE_MODEL") {
            self.provider.openai.title_model = title_model;
        }

        if let Ok(max_history) = std::env::var("CHATFLOW_MAX_HISTORY") {
            if let Ok(value) = max_history.parse() {
                self.chat.max_history_messages = value;
            } else {
                tracing::warn!("Invalid CHATFLOW_MAX_HISTORY: {}", max_history);
            }
        }

        if let Ok(timeout) = std::env::var("CHATFLOW_STREAM_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.chat.stream_idle_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid CHATFLOW_STREAM_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(owner_id) = std::env::var("CHATFLOW_OWNER_ID") {
            self.identity.owner_id = owner_id;
        }

        if let Ok(db_path) = std::env::var("CHATFLOW_DB") {
            tracing::debug!(db_path = %db_path, "Env override: CHATFLOW_DB");
            self.storage.path = Some(db_path);
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(path) = &cli.storage_path {
            self.storage.path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are within acceptable ranges
    /// and that required fields are properly set.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.provider.provider_type.is_empty() {
            return Err(ChatflowError::Config("Provider type cannot be empty".to_string()).into());
        }

        let valid_providers = ["openai"];
        if !valid_providers.contains(&self.provider.provider_type.as_str()) {
            return Err(ChatflowError::Config(format!(
                "Invalid provider type: {}. Must be one of: {}",
                self.provider.provider_type,
                valid_providers.join(", ")
            ))
            .into());
        }

        if self.chat.max_history_messages == 0 {
            return Err(ChatflowError::Config(
                "chat.max_history_messages must be greater than 0".to_string(),
            )
            .into());
        }

        if self.chat.max_history_messages > 1000 {
            return Err(ChatflowError::Config(
                "chat.max_history_messages must be less than or equal to 1000".to_string(),
            )
            .into());
        }

        if self.chat.stream_idle_timeout_seconds == 0 {
            return Err(ChatflowError::Config(
                "chat.stream_idle_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        for (tier, limit) in [("free", &self.quota.free), ("pro", &self.quota.pro)] {
            if limit.monthly_limit == 0 {
                return Err(ChatflowError::Config(format!(
                    "quota.{}.monthly_limit must be greater than 0",
                    tier
                ))
                .into());
            }
            if let Some(daily) = limit.daily_limit {
                if daily == 0 || daily > limit.monthly_limit {
                    return Err(ChatflowError::Config(format!(
                        "quota.{}.daily_limit must be between 1 and monthly_limit",
                        tier
                    ))
                    .into());
                }
            }
        }

        if self.identity.owner_id.trim().is_empty() {
            return Err(
                ChatflowError::Config("identity.owner_id cannot be empty".to_string()).into(),
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
