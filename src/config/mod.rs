use chrono::{FixedOffset, Offset, Utc};
use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use validator::Validate;

use crate::poller::{DEFAULT_USER_AGENT, DEVICE_ID_PLACEHOLDER};
use crate::services::auth::TokenKind;
use crate::services::notifier::DEFAULT_TELEGRAM_API_BASE;
use crate::services::retry::RetryPolicy;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HTTP_TRIES: u32 = 3;
const DEFAULT_HTTP_DELAY_MS: u64 = 1000;
const DEFAULT_HTTP_BACKOFF: u32 = 2;
const DEFAULT_TOKEN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub id: String,
    pub user_id: u64,
    /// Hex-encoded shared secret.
    #[validate(length(min = 2))]
    pub session_token: String,
    pub token_kind: TokenKind,
    /// Feed URL with a `{device_id}` placeholder.
    #[validate(length(min = 1))]
    pub url_template: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AuthConfig {
    /// Program (plus arguments) that prints a bearer token.
    #[validate(length(min = 1))]
    pub token_command: String,
    #[validate(range(min = 1))]
    pub token_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct HttpConfig {
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
    #[validate(range(min = 1, max = 10))]
    pub tries: u32,
    pub delay_ms: u64,
    #[validate(range(min = 1))]
    pub backoff: u32,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct TelegramConfig {
    #[validate(length(min = 1))]
    pub api_token: String,
    pub chat_id: i64,
    pub log_chat_id: i64,
    #[validate(length(min = 1))]
    pub api_base_url: String,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct PollConfig {
    #[validate(range(min = 1))]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct LogConfig {
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    pub file: Option<String>,
    #[validate(range(min = -12, max = 14))]
    pub tz_offset_hours: i32,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub device: DeviceConfig,
    #[validate(nested)]
    pub auth: AuthConfig,
    #[validate(nested)]
    pub http: HttpConfig,
    #[validate(nested)]
    pub telegram: TelegramConfig,
    #[validate(nested)]
    pub poll: PollConfig,
    #[validate(nested)]
    pub log: LogConfig,
}

fn parse_int(name: &str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse::<i64>().map_err(|e| {
        ConfigError::Message(format!(
            "Invalid value for {}: '{}': {}. Expected an integer.",
            name, value, e
        ))
    })
}

fn int_var(name: &str) -> Result<Option<i64>, ConfigError> {
    env::var(name).ok().map(|v| parse_int(name, &v)).transpose()
}

/// First of the given variables that is set, read verbatim.
fn string_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| env::var(name).ok())
}

impl AppConfig {
    /// Loads `.env`, then `APP_<SECTION>__<KEY>` variables, then the flat
    /// variable names used by earlier deployments (`DEVICE_ID`, `CRON_DELAY`,
    /// ...), which take precedence.
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .set_default("device.user_agent", DEFAULT_USER_AGENT)?
            .set_default("auth.token_timeout_secs", DEFAULT_TOKEN_TIMEOUT_SECS)?
            .set_default("http.timeout_secs", DEFAULT_HTTP_TIMEOUT_SECS)?
            .set_default("http.tries", DEFAULT_HTTP_TRIES as i64)?
            .set_default("http.delay_ms", DEFAULT_HTTP_DELAY_MS)?
            .set_default("http.backoff", DEFAULT_HTTP_BACKOFF as i64)?
            .set_default("telegram.api_base_url", DEFAULT_TELEGRAM_API_BASE)?
            .set_default("poll.interval_secs", DEFAULT_POLL_INTERVAL_SECS)?
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?
            .set_default("log.tz_offset_hours", 0)?
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            // Identifiers and secrets are read verbatim so numeric-looking
            // values keep their leading zeros.
            .set_override_option("device.id", string_var(&["DEVICE_ID", "APP_DEVICE__ID"]))?
            .set_override_option(
                "device.session_token",
                string_var(&["SESSION_TOKEN", "APP_DEVICE__SESSION_TOKEN"]),
            )?
            .set_override_option("device.user_id", int_var("USER_ID")?)?
            .set_override_option("device.token_kind", env::var("SESSION_TOKEN_TYPE").ok())?
            .set_override_option("device.url_template", env::var("URL_USER_LOG").ok())?
            .set_override_option(
                "telegram.api_token",
                string_var(&["TELEGRAM_API_TOKEN", "APP_TELEGRAM__API_TOKEN"]),
            )?
            .set_override_option("telegram.chat_id", int_var("TELEGRAM_CHAT_ID")?)?
            .set_override_option("telegram.log_chat_id", int_var("TELEGRAM_LOG_CHAT_ID")?)?
            .set_override_option("poll.interval_secs", int_var("CRON_DELAY")?)?
            // TZ doubles as the standard zone-name variable; only whole-hour
            // offsets are taken from it.
            .set_override_option(
                "log.tz_offset_hours",
                env::var("TZ").ok().and_then(|v| v.trim().parse::<i64>().ok()),
            )?
            .build()?;

        let config: AppConfig = s.try_deserialize()?;

        if let Err(e) = config.validate() {
            return Err(ConfigError::Message(format!("Validation error: {}", e)));
        }

        match hex::decode(config.device.session_token.trim()) {
            Ok(secret) if !secret.is_empty() => {}
            Ok(_) => {
                return Err(ConfigError::Message(
                    "SESSION_TOKEN must not be empty".into(),
                ))
            }
            Err(e) => {
                return Err(ConfigError::Message(format!(
                    "SESSION_TOKEN must be hex-encoded: {}",
                    e
                )))
            }
        }

        if !config.device.url_template.contains(DEVICE_ID_PLACEHOLDER) {
            return Err(ConfigError::Message(format!(
                "URL_USER_LOG must contain the {} placeholder",
                DEVICE_ID_PLACEHOLDER
            )));
        }

        Ok(config)
    }

    /// Decoded shared secret. Checked by [`AppConfig::new`].
    pub fn session_secret(&self) -> anyhow::Result<Vec<u8>> {
        Ok(hex::decode(self.device.session_token.trim())?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.http.tries,
            Duration::from_millis(self.http.delay_ms),
            self.http.backoff,
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.token_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs)
    }

    pub fn tz_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.log.tz_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }
}
