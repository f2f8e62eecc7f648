//! Client configuration.
//!
//! Built from `FIELDSYNC_*` environment variables or from a JSON document.
//! Both routes go through the same validation.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::geometry::DEFAULT_SRID;
use crate::remote::{normalize_rest_url, PostgrestRemoteStore};
use crate::sync::RetryPolicy;
use crate::util::normalize_text_option;

const DEFAULT_DB_PATH: &str = "fieldsync.db";
const DEFAULT_RETRY_BASE_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 300;
const MAX_RETRY_BASE_SECS: u64 = 3_600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Backend connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// REST root, normalized to end in `/rest/v1`
    pub rest_url: String,
    pub api_key: String,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("rest_url", &self.rest_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub db_path: PathBuf,
    pub default_srid: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Layers pulled on each cycle
    pub active_layers: Vec<String>,
    /// `None` runs the client without a backend
    pub remote: Option<RemoteConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            default_srid: DEFAULT_SRID,
            retry_base: Duration::from_secs(DEFAULT_RETRY_BASE_SECS),
            retry_max: Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
            active_layers: Vec::new(),
            remote: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let rest_url = optional_trimmed(&lookup, "FIELDSYNC_REST_URL");
        let api_key = optional_trimmed(&lookup, "FIELDSYNC_API_KEY");
        let remote = match (rest_url, api_key) {
            (Some(url), Some(key)) => Some(remote_config(&url, key, "FIELDSYNC_REST_URL")?),
            (Some(_), None) => return Err(ConfigError::MissingVar("FIELDSYNC_API_KEY")),
            (None, Some(_)) => return Err(ConfigError::MissingVar("FIELDSYNC_REST_URL")),
            (None, None) => None,
        };

        let default_srid = parse_number(&lookup, "FIELDSYNC_DEFAULT_SRID")?
            .unwrap_or(DEFAULT_SRID);
        let retry_base_secs = parse_number(&lookup, "FIELDSYNC_RETRY_BASE_SECS")?
            .unwrap_or(DEFAULT_RETRY_BASE_SECS);
        let retry_max_secs = parse_number(&lookup, "FIELDSYNC_RETRY_MAX_SECS")?
            .unwrap_or(DEFAULT_RETRY_MAX_SECS);

        let active_layers = optional_trimmed(&lookup, "FIELDSYNC_ACTIVE_LAYERS")
            .map(|value| split_layers(&value))
            .unwrap_or_default();

        build(RawConfig {
            db_path: PathBuf::from(value_or_default(
                &lookup,
                "FIELDSYNC_DB_PATH",
                DEFAULT_DB_PATH,
            )),
            default_srid,
            retry_base_secs,
            retry_max_secs,
            active_layers,
            remote,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base, self.retry_max)
    }

    /// HTTP remote store for the configured backend, if any.
    pub fn remote_store(&self) -> Result<Option<PostgrestRemoteStore>, ConfigError> {
        self.remote
            .as_ref()
            .map(|remote| {
                PostgrestRemoteStore::new(&remote.rest_url, remote.api_key.clone())
                    .map_err(|error| ConfigError::Invalid(error.to_string()))
            })
            .transpose()
    }
}

/// JSON form of [`ClientConfig`]. Every field is optional.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientConfigFile {
    #[serde(default)]
    db_path: Option<PathBuf>,
    #[serde(default)]
    default_srid: Option<u32>,
    #[serde(default)]
    retry_base_secs: Option<u64>,
    #[serde(default)]
    retry_max_secs: Option<u64>,
    #[serde(default)]
    active_layers: Vec<String>,
    #[serde(default)]
    rest_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

/// Parse a JSON client configuration. Unknown keys are rejected.
pub fn parse_client_config(raw: &str) -> Result<ClientConfig, ConfigError> {
    let file: ClientConfigFile = serde_json::from_str(raw)
        .map_err(|error| ConfigError::Invalid(format!("client config: {error}")))?;

    let remote = match (
        normalize_text_option(file.rest_url),
        normalize_text_option(file.api_key),
    ) {
        (Some(url), Some(key)) => Some(remote_config(&url, key, "rest_url")?),
        (None, None) => None,
        _ => {
            return Err(ConfigError::Invalid(
                "rest_url and api_key must be set together".to_string(),
            ))
        }
    };

    build(RawConfig {
        db_path: file
            .db_path
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
        default_srid: file.default_srid.unwrap_or(DEFAULT_SRID),
        retry_base_secs: file.retry_base_secs.unwrap_or(DEFAULT_RETRY_BASE_SECS),
        retry_max_secs: file.retry_max_secs.unwrap_or(DEFAULT_RETRY_MAX_SECS),
        active_layers: file
            .active_layers
            .iter()
            .filter_map(|layer| normalize_text_option(Some(layer.clone())))
            .collect(),
        remote,
    })
}

struct RawConfig {
    db_path: PathBuf,
    default_srid: u32,
    retry_base_secs: u64,
    retry_max_secs: u64,
    active_layers: Vec<String>,
    remote: Option<RemoteConfig>,
}

fn build(raw: RawConfig) -> Result<ClientConfig, ConfigError> {
    if raw.default_srid == 0 {
        return Err(ConfigError::Invalid(
            "default SRID must be greater than 0".to_string(),
        ));
    }
    if raw.retry_base_secs > MAX_RETRY_BASE_SECS {
        return Err(ConfigError::Invalid(format!(
            "retry base delay must be in [0, {MAX_RETRY_BASE_SECS}] seconds"
        )));
    }
    if raw.retry_max_secs < raw.retry_base_secs {
        return Err(ConfigError::Invalid(
            "retry max delay must be >= the base delay".to_string(),
        ));
    }

    Ok(ClientConfig {
        db_path: raw.db_path,
        default_srid: raw.default_srid,
        retry_base: Duration::from_secs(raw.retry_base_secs),
        retry_max: Duration::from_secs(raw.retry_max_secs),
        active_layers: raw.active_layers,
        remote: raw.remote,
    })
}

fn remote_config(url: &str, api_key: String, name: &str) -> Result<RemoteConfig, ConfigError> {
    let rest_url = normalize_rest_url(url)
        .map_err(|_| ConfigError::Invalid(format!("{name} must start with http:// or https://")))?;
    Ok(RemoteConfig { rest_url, api_key })
}

fn split_layers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|layer| !layer.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    optional_trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
