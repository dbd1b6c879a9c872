use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "ZEKAI_";
const KEYRING_SERVICE: &str = "zekai_api_token";

// Runtime settings for the chat client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_chats: usize,
    pub notify_debounce_ms: u64,
    pub storage_path: String,
    // 'env:VAR_NAME', 'keyring', or unset for anonymous requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token_ref: Option<String>,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            max_chats: 6,
            notify_debounce_ms: 50,
            storage_path: "zekai.sqlite".to_string(),
            api_token_ref: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }

    /// Defaults overlaid with `ZEKAI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = var("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v.parse().context("ZEKAI_REQUEST_TIMEOUT_MS must be an integer")?;
        }
        if let Some(v) = var("RETRY_ATTEMPTS") {
            config.retry_attempts = v.parse().context("ZEKAI_RETRY_ATTEMPTS must be an integer")?;
        }
        if let Some(v) = var("RETRY_DELAY_MS") {
            config.retry_delay_ms = v.parse().context("ZEKAI_RETRY_DELAY_MS must be an integer")?;
        }
        if let Some(v) = var("MAX_CHATS") {
            config.max_chats = v.parse().context("ZEKAI_MAX_CHATS must be an integer")?;
        }
        if let Some(v) = var("NOTIFY_DEBOUNCE_MS") {
            config.notify_debounce_ms = v.parse().context("ZEKAI_NOTIFY_DEBOUNCE_MS must be an integer")?;
        }
        if let Some(v) = var("STORAGE_PATH") {
            config.storage_path = v;
        }
        if let Some(v) = var("API_TOKEN_REF") {
            config.api_token_ref = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.log_level = v;
        }

        if config.retry_attempts == 0 {
            anyhow::bail!("ZEKAI_RETRY_ATTEMPTS must be at least 1");
        }
        Ok(config)
    }

    /// Resolves the bearer token for the backend, if one is configured.
    /// `api_token_ref` decides whether it comes from an environment variable
    /// or the OS keyring.
    pub fn api_token(&self) -> Result<Option<String>> {
        match self.api_token_ref.as_deref() {
            None => Ok(None),
            Some(ref_str) if ref_str.starts_with("env:") => {
                let env_var_name = ref_str.trim_start_matches("env:");
                log::debug!("Retrieving API token from environment variable: {}", env_var_name);
                std::env::var(env_var_name)
                    .map(Some)
                    .context(format!("Failed to get API token from environment variable '{}'", env_var_name))
            }
            Some("keyring") => {
                let entry = Entry::new(KEYRING_SERVICE, &self.base_url).context("Failed to create keyring entry")?;
                log::debug!("Retrieving API token from keyring for {}", self.base_url);
                entry
                    .get_password()
                    .map(Some)
                    .context(format!("Failed to get API token from keyring for '{}'", self.base_url))
            }
            Some(other) => Err(anyhow::anyhow!("Unsupported api_token_ref format: {}", other)),
        }
    }
}
