use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, GatewayError};
use crate::retry::{RetryConfigFactory, RetryPolicy};
use crate::stream::Phase;
use crate::timeout::TimeoutConfig;

/// Serializable form of a start-phase [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_base")]
    pub delay_base: f64,
    #[serde(default = "ErrorKind::default_retryable")]
    pub retryable_kinds: HashSet<ErrorKind>,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_delay_base() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_base: default_delay_base(),
            retryable_kinds: ErrorKind::default_retryable(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.delay_base)
            .with_retryable_kinds(self.retryable_kinds.iter().copied())
    }
}

/// Everything the streaming adapter needs besides the starter and
/// translators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub start_retry: RetrySettings,
    /// Emit a `mid_stream` record for every content event.
    #[serde(default)]
    pub verbose_logging: bool,
}

impl StreamingConfig {
    /// Builds a config from `GATEWAY_*` environment variables on top of the
    /// defaults.
    ///
    /// - `GATEWAY_START_TIMEOUT_SECS`, `GATEWAY_MID_STREAM_IDLE_SECS`,
    ///   `GATEWAY_REQUEST_TIMEOUT_SECS`, `GATEWAY_OVERALL_TIMEOUT_SECS`
    /// - `GATEWAY_START_MAX_ATTEMPTS`, `GATEWAY_RETRY_DELAY_BASE`
    /// - `GATEWAY_RETRYABLE_KINDS`: comma-separated kinds (`RATE_LIMIT,TIMEOUT`)
    /// - `GATEWAY_VERBOSE_STREAM_LOGS`: boolean
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GatewayError> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = var("GATEWAY_START_TIMEOUT_SECS") {
            config.timeouts.start_secs = parse_number(&raw, "GATEWAY_START_TIMEOUT_SECS")?;
        }
        if let Some(raw) = var("GATEWAY_MID_STREAM_IDLE_SECS") {
            config.timeouts.mid_stream_idle_secs =
                parse_number(&raw, "GATEWAY_MID_STREAM_IDLE_SECS")?;
        }
        if let Some(raw) = var("GATEWAY_REQUEST_TIMEOUT_SECS") {
            config.timeouts.request_secs = parse_number(&raw, "GATEWAY_REQUEST_TIMEOUT_SECS")?;
        }
        if let Some(raw) = var("GATEWAY_OVERALL_TIMEOUT_SECS") {
            config.timeouts.overall_secs =
                Some(parse_number(&raw, "GATEWAY_OVERALL_TIMEOUT_SECS")?);
        }
        if let Some(raw) = var("GATEWAY_START_MAX_ATTEMPTS") {
            config.start_retry.max_attempts = parse_number(&raw, "GATEWAY_START_MAX_ATTEMPTS")?;
        }
        if let Some(raw) = var("GATEWAY_RETRY_DELAY_BASE") {
            config.start_retry.delay_base = parse_number(&raw, "GATEWAY_RETRY_DELAY_BASE")?;
        }
        if let Some(raw) = var("GATEWAY_RETRYABLE_KINDS") {
            config.start_retry.retryable_kinds = raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    ErrorKind::from_str(part).map_err(|err| {
                        GatewayError::Config(format!("GATEWAY_RETRYABLE_KINDS: {err}"))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(raw) = var("GATEWAY_VERBOSE_STREAM_LOGS") {
            config.verbose_logging = parse_bool(&raw).ok_or_else(|| {
                GatewayError::Config(format!(
                    "GATEWAY_VERBOSE_STREAM_LOGS: expected a boolean, got {raw:?}"
                ))
            })?;
        }
        Ok(config)
    }

    /// Start-phase policy from `start_retry`; every other phase gets a single
    /// attempt.
    pub fn retry_factory(&self) -> RetryConfigFactory {
        let start = self.start_retry.to_policy();
        Arc::new(move |phase| match phase {
            Phase::Start => start.clone(),
            Phase::MidStream | Phase::Finalize => RetryPolicy::single_attempt(),
        })
    }
}

fn parse_number<T: FromStr>(raw: &str, key: &str) -> Result<T, GatewayError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| GatewayError::Config(format!("{key}: invalid value {raw:?}: {err}")))
}

/// Boolean env spelling shared by every `GATEWAY_*` flag.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}
