//! Environment-backed tuning for the sync engine.

use std::{env, error::Error, fmt, str::FromStr, time::Duration};

use sync_core::ReconnectPolicy;

const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_RETRIES: u32 = 3;
const DEFAULT_READ_RECEIPT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_PAGE_SIZE: u16 = 20;
const MAX_PAGE_SIZE: u16 = 100;
const DEFAULT_EVENT_BUFFER: usize = 512;

/// Runtime configuration consumed by `spawn_engine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base delay of the linear reconnect backoff.
    pub reconnect_base_delay_ms: u64,
    /// Consecutive failed attempts before a subscription gives up.
    pub reconnect_max_retries: u32,
    /// Window collapsing repeated "room viewed" signals into one mark-as-read.
    pub read_receipt_debounce_ms: u64,
    /// History page size requested on open and `load_more`.
    pub page_size: u16,
    /// Capacity of the broadcast event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_retries: DEFAULT_RECONNECT_MAX_RETRIES,
            read_receipt_debounce_ms: DEFAULT_READ_RECEIPT_DEBOUNCE_MS,
            page_size: DEFAULT_PAGE_SIZE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let reconnect_base_delay_ms = parse_or_default(
            "TRIPMATE_RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_retries = parse_or_default(
            "TRIPMATE_RECONNECT_MAX_RETRIES",
            DEFAULT_RECONNECT_MAX_RETRIES,
            &mut lookup,
        )?;
        let read_receipt_debounce_ms = parse_or_default(
            "TRIPMATE_READ_RECEIPT_DEBOUNCE_MS",
            DEFAULT_READ_RECEIPT_DEBOUNCE_MS,
            &mut lookup,
        )?;
        let page_size = parse_or_default("TRIPMATE_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let event_buffer =
            parse_or_default("TRIPMATE_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        if reconnect_max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIPMATE_RECONNECT_MAX_RETRIES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConfigError::InvalidValue {
                key: "TRIPMATE_PAGE_SIZE",
                value: page_size.to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIPMATE_EVENT_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            reconnect_base_delay_ms,
            reconnect_max_retries,
            read_receipt_debounce_ms,
            page_size,
            event_buffer,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_base_delay_ms, self.reconnect_max_retries)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.read_receipt_debounce_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
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

fn parse_or_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}
