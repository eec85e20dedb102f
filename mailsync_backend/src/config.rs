use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_call_timeout_secs() -> u64 {
    20
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSyncConfig {
    // Server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL of this service, used for OAuth links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default)]
    pub admin_token: Option<String>,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Telegram
    #[serde(default)]
    pub telegram_bot_token: String,
    /// When set, updates arrive on `/telegram/webhook` and long polling is off.
    #[serde(default)]
    pub telegram_webhook_secret: Option<String>,
    #[serde(default)]
    pub telegram_use_webhook: bool,

    // Text generation (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Gmail
    #[serde(default)]
    pub google_client_id: String,
    #[serde(default)]
    pub google_client_secret: String,
    #[serde(default)]
    pub google_redirect_uri: String,
    /// Fully qualified Pub/Sub topic, e.g. `projects/p/topics/gmail-notifications`.
    #[serde(default)]
    pub gmail_pubsub_topic: String,
    #[serde(default)]
    pub pubsub_verification_token: Option<String>,

    // Subscription lifetime and renewal
    #[serde(default = "default_watch_validity_hours")]
    pub watch_validity_hours: u64,
    #[serde(default = "default_renewal_margin_hours")]
    pub renewal_margin_hours: u64,
    #[serde(default)]
    pub renewal_interval_hours: Option<u64>,

    // Work limits
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
    #[serde(default)]
    pub retry: RetryConfig,

    // Abandoned context cleanup
    #[serde(default = "default_context_ttl_hours")]
    pub context_ttl_hours: u64,
    #[serde(default = "default_context_sweep_interval_mins")]
    pub context_sweep_interval_mins: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8788".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8788".to_string()
}

fn default_database_path() -> String {
    "mailsync.db".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Upper bound for hour-based settings; keeps timer and timestamp math in range.
const MAX_CONFIG_HOURS: u64 = 24 * 365 * 100;

fn default_watch_validity_hours() -> u64 {
    168
}

fn default_renewal_margin_hours() -> u64 {
    24
}

fn default_item_concurrency() -> usize {
    4
}

fn default_context_ttl_hours() -> u64 {
    72
}

fn default_context_sweep_interval_mins() -> u64 {
    60
}

impl Default for MailSyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
            admin_token: None,
            database_path: default_database_path(),
            telegram_bot_token: String::new(),
            telegram_webhook_secret: None,
            telegram_use_webhook: false,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            google_client_id: String::new(),
            google_client_secret: String::new(),
            google_redirect_uri: String::new(),
            gmail_pubsub_topic: String::new(),
            pubsub_verification_token: None,
            watch_validity_hours: default_watch_validity_hours(),
            renewal_margin_hours: default_renewal_margin_hours(),
            renewal_interval_hours: None,
            item_concurrency: default_item_concurrency(),
            retry: RetryConfig::default(),
            context_ttl_hours: default_context_ttl_hours(),
            context_sweep_interval_mins: default_context_sweep_interval_mins(),
        }
    }
}

impl MailSyncConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `MAILSYNC_CONFIG` if set, else `mailsync_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("MAILSYNC_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("mailsync_config.toml"),
        }
    }

    /// Load the TOML config (defaults when missing or unparsable), then overlay
    /// environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env();
        config
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str::<MailSyncConfig>(contents).context("Failed to parse config TOML")
    }

    fn apply_env(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("MAILSYNC_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = get("MAILSYNC_PUBLIC_URL") {
            self.public_base_url = v;
        }
        if let Some(v) = get("MAILSYNC_ADMIN_TOKEN") {
            self.admin_token = Some(v);
        }
        if let Some(v) = get("MAILSYNC_DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = v;
        }
        if let Some(v) = get("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram_webhook_secret = Some(v);
        }
        if let Some(v) = get("TELEGRAM_USE_WEBHOOK") {
            self.telegram_use_webhook = v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes");
        }
        if let Some(v) = get("LLM_API_URL") {
            self.llm_api_url = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm_model = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Some(v) = get("GOOGLE_CLIENT_ID") {
            self.google_client_id = v;
        }
        if let Some(v) = get("GOOGLE_CLIENT_SECRET") {
            self.google_client_secret = v;
        }
        if let Some(v) = get("GOOGLE_REDIRECT_URI") {
            self.google_redirect_uri = v;
        }
        if let Some(v) = get("GMAIL_PUBSUB_TOPIC") {
            self.gmail_pubsub_topic = v;
        }
        if let Some(v) = get("PUBSUB_VERIFICATION_TOKEN") {
            self.pubsub_verification_token = Some(v);
        }
        if let Some(hours) = get("MAILSYNC_RENEWAL_INTERVAL_HOURS").and_then(|v| v.parse().ok()) {
            self.renewal_interval_hours = Some(hours);
        }
    }

    /// Recurring renewal interval, derived from the subscription validity
    /// window. An explicit override is honoured only when it still renews
    /// before expiry.
    pub fn renewal_interval(&self) -> Duration {
        let validity = self.watch_validity_hours.max(2);
        let derived = validity
            .saturating_sub(self.renewal_margin_hours)
            .clamp(1, validity - 1);

        let hours = match self.renewal_interval_hours {
            Some(hours) if hours > 0 && hours < validity => hours,
            Some(hours) => {
                tracing::warn!(
                    "renewal_interval_hours={} is not shorter than the {}h validity window; using {}h",
                    hours,
                    validity,
                    derived
                );
                derived
            }
            None => derived,
        };
        Duration::from_secs(hours.min(MAX_CONFIG_HOURS) * 3600)
    }

    pub fn context_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.context_ttl_hours.clamp(1, MAX_CONFIG_HOURS) as i64)
    }

    pub fn context_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.context_sweep_interval_mins.clamp(1, MAX_CONFIG_HOURS * 60) * 60)
    }

    /// OAuth start link for a conversation.
    pub fn connect_url(&self, conversation_id: i64) -> String {
        format!(
            "{}/gmail/auth?conversation_id={}",
            self.public_base_url.trim_end_matches('/'),
            conversation_id
        )
    }
}
