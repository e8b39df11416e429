//! Environment-backed runtime configuration for `courier-daemon`.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use courier_core::{RetryPolicy, TransportOptions, normalize_recipients, retry_cache};
use courier_runtime::SupervisorConfig;

const DEFAULT_SESSION_DIR: &str = "./session";
const DEFAULT_MAX_RECONNECT: u32 = 3;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 10_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_CONNECT_RETRY_BASE_DELAY_MS: u64 = 5_000;
const DEFAULT_CONNECT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RECIPIENT_DOMAIN: &str = "s.whatsapp.net";
const DEFAULT_BOT_NAME: &str = "Courier";
const DEFAULT_PREFIX: &str = ".";
const DEFAULT_TRANSPORT_ADDR: &str = "127.0.0.1:7420";

/// Runtime configuration used by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Operator-supplied session token, if any.
    pub session_token: Option<String>,
    pub session_dir: PathBuf,
    /// Reconnect budget; 0 disables retries.
    pub max_reconnect: u32,
    pub close_retry: RetryPolicy,
    pub connect_retry: RetryPolicy,
    pub auto_reject_calls: bool,
    /// Normalized startup notification recipients.
    pub owner_recipients: Vec<String>,
    pub bot_name: String,
    pub prefix: String,
    pub public_mode: bool,
    /// Address of the protocol bridge.
    pub transport_addr: String,
    pub retry_cache_ttl: Duration,
    pub retry_cache_capacity: usize,
}

impl DaemonConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let session_token = optional_trimmed_env("SESSION_TOKEN", &mut lookup)
            .or_else(|| optional_trimmed_env("SESSION_ID", &mut lookup));
        let session_dir = optional_trimmed_env("SESSION_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_DIR));

        let max_reconnect = parse_optional_u32("MAX_RECONNECT", &mut lookup)?
            .unwrap_or(DEFAULT_MAX_RECONNECT);
        let close_retry = RetryPolicy::new(
            parse_optional_u64("RECONNECT_BASE_DELAY_MS", &mut lookup)?
                .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
            parse_optional_u64("RECONNECT_MAX_DELAY_MS", &mut lookup)?
                .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
        );
        let connect_retry = RetryPolicy::new(
            parse_optional_u64("CONNECT_RETRY_BASE_DELAY_MS", &mut lookup)?
                .unwrap_or(DEFAULT_CONNECT_RETRY_BASE_DELAY_MS),
            parse_optional_u64("CONNECT_RETRY_MAX_DELAY_MS", &mut lookup)?
                .unwrap_or(DEFAULT_CONNECT_RETRY_MAX_DELAY_MS),
        );

        let auto_reject_calls = parse_optional_bool("AUTO_REJECT_CALLS", &mut lookup)?;
        let recipient_domain = optional_trimmed_env("RECIPIENT_DOMAIN", &mut lookup)
            .unwrap_or_else(|| DEFAULT_RECIPIENT_DOMAIN.to_owned());
        let owner_recipients = optional_trimmed_env("OWNER_NUMBERS", &mut lookup)
            .map(|raw| normalize_recipients(&raw, &recipient_domain))
            .unwrap_or_default();

        let bot_name = optional_trimmed_env("BOT_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_BOT_NAME.to_owned());
        let prefix = optional_trimmed_env("PREFIX", &mut lookup)
            .unwrap_or_else(|| DEFAULT_PREFIX.to_owned());
        let public_mode = parse_optional_bool("PUBLIC_MODE", &mut lookup)?;
        let transport_addr = optional_trimmed_env("TRANSPORT_ADDR", &mut lookup)
            .unwrap_or_else(|| DEFAULT_TRANSPORT_ADDR.to_owned());

        let retry_cache_ttl = parse_optional_u64("RETRY_CACHE_TTL_SECS", &mut lookup)?
            .map(Duration::from_secs)
            .unwrap_or(retry_cache::DEFAULT_TTL);
        let retry_cache_capacity = parse_optional_usize("RETRY_CACHE_CAPACITY", &mut lookup)?
            .unwrap_or(retry_cache::DEFAULT_CAPACITY);

        if retry_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RETRY_CACHE_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if retry_cache_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RETRY_CACHE_TTL_SECS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if retry_cache_ttl > retry_cache::MAX_TTL {
            return Err(ConfigError::InvalidValue {
                key: "RETRY_CACHE_TTL_SECS",
                value: retry_cache_ttl.as_secs().to_string(),
                reason: format!("must be at most {}", retry_cache::MAX_TTL.as_secs()),
            });
        }

        Ok(Self {
            session_token,
            session_dir,
            max_reconnect,
            close_retry,
            connect_retry,
            auto_reject_calls,
            owner_recipients,
            bot_name,
            prefix,
            public_mode,
            transport_addr,
            retry_cache_ttl,
            retry_cache_capacity,
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_reconnect: self.max_reconnect,
            close_retry: self.close_retry,
            connect_retry: self.connect_retry,
            transport_options: TransportOptions::default(),
            cache_sweep_interval: retry_cache::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_optional::<u32, F>(key, lookup)
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_optional::<u64, F>(key, lookup)
}

fn parse_optional_usize<F>(
    key: &'static str,
    lookup: &mut F,
) -> Result<Option<usize>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_optional::<usize, F>(key, lookup)
}

/// Unset means `false`.
fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true/false, yes/no, on/off or 1/0".to_owned(),
        }),
    }
}
