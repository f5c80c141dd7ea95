//! Agent configuration: a config file, a keys file and environment overrides
//! for every key.

use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use publisher_signer::SignatureType;

use crate::error::ConfigError;
use crate::model::{AuthToken, OracleId};

pub const DEFAULT_CLOCK_PERIOD: Duration = Duration::from_millis(500);
pub const DEFAULT_DELTA_CHECK_PERIOD: Duration = Duration::from_millis(10);
pub const DEFAULT_CHANGE_THRESHOLD_PERCENT: f64 = 0.1;
pub const DEFAULT_REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_BROKER_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PUBLISHER_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_PULL_BASED_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_PULL_BASED_READ_TIMEOUT: Duration = Duration::from_secs(10);

const ORACLE_ID_LENGTH: usize = 5;
const ENV_PREFIX: &str = "PUBLISHER_AGENT_";

/// Config file as written on disk. Durations use `humantime` syntax
/// (`500ms`, `1m30s`, `100us`); a bare `0` is zero.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigFile {
    pub signature_types: Vec<SignatureType>,
    #[serde(deserialize_with = "optional_duration")]
    pub clock_period: Option<Duration>,
    #[serde(deserialize_with = "optional_duration")]
    pub delta_check_period: Option<Duration>,
    /// 0-100
    pub change_threshold_percent: Option<f64>,
    pub registry_base_url: Option<String>,
    #[serde(deserialize_with = "optional_duration")]
    pub registry_refresh_interval: Option<Duration>,
    #[serde(deserialize_with = "optional_duration")]
    pub broker_reconnect_delay: Option<Duration>,
    pub publisher_metadata_base_url: Option<String>,
    #[serde(deserialize_with = "optional_duration")]
    pub publisher_metadata_refresh_interval: Option<Duration>,
    pub pull_based_ws_url: Option<String>,
    pub pull_based_ws_subscription_request: Option<String>,
    #[serde(deserialize_with = "optional_duration")]
    pub pull_based_ws_reconnect_delay: Option<Duration>,
    #[serde(deserialize_with = "optional_duration")]
    pub pull_based_ws_read_timeout: Option<Duration>,
    pub sign_every_update: bool,
    pub incoming_ws_port: u16,
    pub health_port: u16,
}

/// Keys file as written on disk. Any field may come from the environment.
#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KeysFile {
    pub evm_private_key: Option<String>,
    pub evm_public_key: Option<String>,
    pub stark_private_key: Option<String>,
    pub stark_public_key: Option<String>,
    pub oracle_id: Option<String>,
    pub pull_based_auth: Option<String>,
    pub registry_auth: Option<String>,
}

impl KeysFile {
    /// Overwrite fields with any non-empty `PUBLISHER_AGENT_*` value
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut Option<String>); 7] = [
            ("EVM_PRIVATE_KEY", &mut self.evm_private_key),
            ("EVM_PUBLIC_KEY", &mut self.evm_public_key),
            ("STARK_PRIVATE_KEY", &mut self.stark_private_key),
            ("STARK_PUBLIC_KEY", &mut self.stark_public_key),
            ("ORACLE_ID", &mut self.oracle_id),
            ("PULL_BASED_AUTH", &mut self.pull_based_auth),
            ("REGISTRY_AUTH", &mut self.registry_auth),
        ];
        for (suffix, field) in fields {
            if let Some(value) = lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.is_empty()) {
                *field = Some(value);
            }
        }
    }
}

/// Validated keys
#[derive(Clone, Default)]
pub struct Keys {
    pub evm_private_key: Option<String>,
    pub evm_public_key: Option<String>,
    pub stark_private_key: Option<String>,
    pub stark_public_key: Option<String>,
    pub oracle_id: OracleId,
    pub pull_based_auth: Option<AuthToken>,
    pub registry_auth: AuthToken,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Keys")
            .field("evm_private_key", &redact(&self.evm_private_key))
            .field("evm_public_key", &self.evm_public_key)
            .field("stark_private_key", &redact(&self.stark_private_key))
            .field("stark_public_key", &self.stark_public_key)
            .field("oracle_id", &self.oracle_id)
            .field("pull_based_auth", &redact(&self.pull_based_auth))
            .field("registry_auth", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PullBasedConfig {
    pub url: String,
    pub subscription_request: Option<String>,
    pub reconnect_delay: Duration,
    pub read_timeout: Duration,
}

/// Fully resolved agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub signature_types: Vec<SignatureType>,
    pub clock_period: Duration,
    pub delta_check_period: Duration,
    /// 0-1
    pub change_threshold_proportion: f64,
    pub registry_base_url: String,
    pub registry_refresh_interval: Duration,
    pub broker_reconnect_delay: Duration,
    pub publisher_metadata_base_url: String,
    pub publisher_metadata_refresh_interval: Duration,
    pub pull_based: Option<PullBasedConfig>,
    pub sign_every_update: bool,
    pub incoming_ws_port: u16,
    pub health_port: u16,
    pub keys: Keys,
}

impl AgentConfig {
    /// Load both files, apply environment overrides and validate. A missing
    /// or unreadable keys file is tolerated since the environment may carry
    /// every key.
    pub fn load(config_path: &Path, keys_path: &Path) -> Result<Self, ConfigError> {
        let content = read(config_path)?;
        let config: ConfigFile = parse(config_path, &content)?;

        let mut keys = match std::fs::read_to_string(keys_path) {
            Ok(content) => parse(keys_path, &content)?,
            Err(e) => {
                debug!(path = %keys_path.display(), error = %e, "Keys file not readable, using environment only");
                KeysFile::default()
            }
        };
        keys.apply_overrides(|name| std::env::var(name).ok());

        Self::resolve(config, keys)
    }

    /// Apply defaults and validation rules
    pub fn resolve(config: ConfigFile, keys: KeysFile) -> Result<Self, ConfigError> {
        if config.signature_types.is_empty() {
            return Err(invalid("must specify at least one signature type"));
        }
        for (i, signature_type) in config.signature_types.iter().enumerate() {
            if config.signature_types[..i].contains(signature_type) {
                return Err(invalid(format!("duplicate signature type: {}", signature_type)));
            }
            match signature_type {
                SignatureType::Evm => {
                    require_hex(&keys.evm_private_key, "EVM private key")?;
                    require_hex(&keys.evm_public_key, "EVM public key")?;
                }
                SignatureType::Stark => {
                    require_hex(&keys.stark_private_key, "Stark private key")?;
                    require_hex(&keys.stark_public_key, "Stark public key")?;
                }
            }
        }

        let oracle_id = keys.oracle_id.clone().unwrap_or_default();
        if oracle_id.chars().count() != ORACLE_ID_LENGTH {
            return Err(invalid(format!("oracle id length must be {}", ORACLE_ID_LENGTH)));
        }

        let clock_period = config.clock_period.unwrap_or(DEFAULT_CLOCK_PERIOD);
        let delta_check_period = positive(
            config.delta_check_period.unwrap_or(DEFAULT_DELTA_CHECK_PERIOD),
            "delta check period",
        )?;
        let registry_refresh_interval = positive(
            config
                .registry_refresh_interval
                .unwrap_or(DEFAULT_REGISTRY_REFRESH_INTERVAL),
            "registry refresh interval",
        )?;
        let broker_reconnect_delay = positive(
            config
                .broker_reconnect_delay
                .unwrap_or(DEFAULT_BROKER_RECONNECT_DELAY),
            "broker reconnect delay",
        )?;
        let publisher_metadata_refresh_interval = positive(
            config
                .publisher_metadata_refresh_interval
                .unwrap_or(DEFAULT_PUBLISHER_METADATA_REFRESH_INTERVAL),
            "publisher metadata refresh interval",
        )?;

        // an explicit zero falls back to the default
        let change_threshold_percent = match config.change_threshold_percent {
            None => DEFAULT_CHANGE_THRESHOLD_PERCENT,
            Some(p) if p == 0.0 => DEFAULT_CHANGE_THRESHOLD_PERCENT,
            Some(p) if p < 0.0 || !p.is_finite() => {
                return Err(invalid("change threshold percent must be positive"))
            }
            Some(p) => p,
        };

        let registry_base_url = non_empty(config.registry_base_url)
            .ok_or_else(|| invalid("must specify a registry base url"))?;
        let publisher_metadata_base_url = non_empty(config.publisher_metadata_base_url)
            .unwrap_or_else(|| registry_base_url.clone());

        let pull_based = match non_empty(config.pull_based_ws_url) {
            Some(url) => Some(PullBasedConfig {
                url,
                subscription_request: non_empty(config.pull_based_ws_subscription_request),
                reconnect_delay: config
                    .pull_based_ws_reconnect_delay
                    .unwrap_or(DEFAULT_PULL_BASED_RECONNECT_DELAY),
                read_timeout: config
                    .pull_based_ws_read_timeout
                    .unwrap_or(DEFAULT_PULL_BASED_READ_TIMEOUT),
            }),
            None => None,
        };
        if config.incoming_ws_port == 0 && pull_based.is_none() {
            return Err(invalid(
                "must specify a websocket url to pull from or a port to expose for incoming websockets",
            ));
        }

        Ok(Self {
            signature_types: config.signature_types,
            clock_period,
            delta_check_period,
            change_threshold_proportion: change_threshold_percent / 100.0,
            registry_base_url,
            registry_refresh_interval,
            broker_reconnect_delay,
            publisher_metadata_base_url,
            publisher_metadata_refresh_interval,
            pull_based,
            sign_every_update: config.sign_every_update,
            incoming_ws_port: config.incoming_ws_port,
            health_port: config.health_port,
            keys: Keys {
                evm_private_key: keys.evm_private_key,
                evm_public_key: keys.evm_public_key,
                stark_private_key: keys.stark_private_key,
                stark_public_key: keys.stark_public_key,
                oracle_id,
                pull_based_auth: non_empty(keys.pull_based_auth),
                registry_auth: keys.registry_auth.unwrap_or_default(),
            },
        })
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn require_hex(value: &Option<String>, name: &str) -> Result<(), ConfigError> {
    match value {
        Some(v) if is_hex_key(v) => Ok(()),
        _ => Err(invalid(format!("must pass a valid {}", name))),
    }
}

/// `0x` followed by at least one hex digit
pub fn is_hex_key(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()))
}

fn positive(duration: Duration, name: &str) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        return Err(invalid(format!("{} must be positive", name)));
    }
    Ok(duration)
}

/// `humantime` duration, plus a bare `0` for zero
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let s = value.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| ConfigError::Duration(format!("{:?}: {}", value, e)))
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) if !value.trim().is_empty() => parse_duration(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
