use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::QuotaConfig;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Quota applied to every identifier
    #[serde(default)]
    #[validate(nested)]
    pub quota: QuotaConfig,

    /// Entry table limits and sweep interval
    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageConfig,

    /// How requests are mapped to identifiers
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Default log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            quota: QuotaConfig::default(),
            storage: StorageConfig::default(),
            identity: IdentityConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    /// Maximum number of tracked identifiers
    #[serde(default = "default_max_size")]
    #[validate(range(min = 1, message = "max_size must be greater than 0"))]
    pub max_size: usize,

    /// Interval between sweeps of expired entries
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_max_size() -> usize {
    10_000
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Per-channel setting. `Unset` means the channel was not configured at all,
/// which the resolver treats differently from an explicit `Disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "options", rename_all = "snake_case")]
pub enum Channel<T> {
    #[default]
    Unset,
    Disabled,
    Defaults,
    Custom(T),
}

impl<T: Clone + Default> Channel<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Channel::Defaults | Channel::Custom(_))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Channel::Disabled)
    }

    /// Options in effect when the channel is enabled.
    pub fn options(&self) -> Option<T> {
        match self {
            Channel::Defaults => Some(T::default()),
            Channel::Custom(options) => Some(options.clone()),
            Channel::Unset | Channel::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpOptions {
    /// Addresses or CIDR ranges that bypass rate limiting
    pub allow_list: Vec<String>,
    /// Addresses or CIDR ranges that are refused outright
    pub block_list: Vec<String>,
    /// Honour the forwarded-address header when the peer is a trusted proxy
    pub trust_forwarded_chain: bool,
    /// Addresses or CIDR ranges of trusted proxies
    pub trusted_proxies: Vec<String>,
    pub forwarded_header: String,
}

impl Default for IpOptions {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            block_list: Vec::new(),
            trust_forwarded_chain: false,
            trusted_proxies: Vec::new(),
            forwarded_header: "x-forwarded-for".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    pub header: String,
    pub query_param: String,
    pub allow_list: Vec<String>,
    pub block_list: Vec<String>,
    /// Throttle by IP when no key is presented
    pub fallback_to_ip: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            header: "x-api-key".to_string(),
            query_param: "api_key".to_string(),
            allow_list: Vec::new(),
            block_list: Vec::new(),
            fallback_to_ip: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub ip: Channel<IpOptions>,
    #[serde(default)]
    pub key: Channel<KeyOptions>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> ThrottlerResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::ConfigurationError(format!("Failed to read {}: {}", path, e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            ThrottlerError::ConfigurationError(format!("Failed to parse {}: {}", path, e))
        })
    }

    /// Load configuration from `THROTTLE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> ThrottlerResult<Self> {
        let mut config = Config::default();

        if let Some(addr) = parse_env::<SocketAddr>("THROTTLE_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(points) = parse_env::<u32>("THROTTLE_POINTS")? {
            config.quota.points = points;
        }
        if let Some(duration) = duration_env("THROTTLE_DURATION")? {
            config.quota.duration = duration;
        }
        if let Some(duration) = duration_env("THROTTLE_BLOCK_DURATION")? {
            config.quota.block_duration = duration;
        }
        if let Some(max_size) = parse_env::<usize>("THROTTLE_MAX_SIZE")? {
            config.storage.max_size = max_size;
        }
        if let Some(interval) = duration_env("THROTTLE_CLEANUP_INTERVAL")? {
            config.storage.cleanup_interval = interval;
        }
        if let Some(level) = env_var("THROTTLE_LOG_LEVEL") {
            config.log_level = level;
        }

        config.identity.ip = ip_channel_from_env()?;
        config.identity.key = key_channel_from_env()?;

        Ok(config)
    }
}

fn ip_channel_from_env() -> ThrottlerResult<Channel<IpOptions>> {
    let mut options = IpOptions::default();
    let mut customised = false;

    if let Some(trust) = parse_env::<bool>("THROTTLE_TRUST_FORWARDED")? {
        options.trust_forwarded_chain = trust;
        customised = true;
    }
    if let Some(list) = list_env("THROTTLE_TRUSTED_PROXIES") {
        options.trusted_proxies = list;
        customised = true;
    }
    if let Some(list) = list_env("THROTTLE_IP_ALLOW") {
        options.allow_list = list;
        customised = true;
    }
    if let Some(list) = list_env("THROTTLE_IP_BLOCK") {
        options.block_list = list;
        customised = true;
    }

    channel_from_env("THROTTLE_IP_CHANNEL", options, customised)
}

fn key_channel_from_env() -> ThrottlerResult<Channel<KeyOptions>> {
    let mut options = KeyOptions::default();
    let mut customised = false;

    if let Some(header) = env_var("THROTTLE_KEY_HEADER") {
        options.header = header;
        customised = true;
    }
    if let Some(param) = env_var("THROTTLE_KEY_QUERY") {
        options.query_param = param;
        customised = true;
    }
    if let Some(list) = list_env("THROTTLE_KEY_ALLOW") {
        options.allow_list = list;
        customised = true;
    }
    if let Some(list) = list_env("THROTTLE_KEY_BLOCK") {
        options.block_list = list;
        customised = true;
    }
    if let Some(fallback) = parse_env::<bool>("THROTTLE_KEY_FALLBACK_TO_IP")? {
        options.fallback_to_ip = fallback;
        customised = true;
    }

    channel_from_env("THROTTLE_KEY_CHANNEL", options, customised)
}

fn channel_from_env<T>(mode_var: &str, options: T, customised: bool) -> ThrottlerResult<Channel<T>> {
    match env_var(mode_var).as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("disabled") | Some("off") | Some("false") => Ok(Channel::Disabled),
        Some("enabled") | Some("on") | Some("true") | Some("defaults") | None => {
            if customised {
                Ok(Channel::Custom(options))
            } else if env_var(mode_var).is_some() {
                Ok(Channel::Defaults)
            } else {
                Ok(Channel::Unset)
            }
        }
        Some(other) => Err(ThrottlerError::ConfigurationError(format!(
            "{} must be 'enabled' or 'disabled', got '{}'",
            mode_var, other
        ))),
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str) -> ThrottlerResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                ThrottlerError::ConfigurationError(format!("Invalid {}: {}", name, e))
            })
        })
        .transpose()
}

fn duration_env(name: &str) -> ThrottlerResult<Option<Duration>> {
    env_var(name)
        .map(|raw| {
            humantime_serde::re::humantime::parse_duration(&raw).map_err(|e| {
                ThrottlerError::ConfigurationError(format!("Invalid {}: {}", name, e))
            })
        })
        .transpose()
}

fn list_env(name: &str) -> Option<Vec<String>> {
    env_var(name).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
