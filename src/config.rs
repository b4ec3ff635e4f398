//! Server configuration from `EASYSLOT_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::MAX_BUFFER_MINUTES;
use crate::model::{MINUTES_PER_DAY, SlotConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Tenant-wide slot defaults; individual queries may override them.
    pub slots: SlotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "easyslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            slots: SlotConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, reason: String },
    Incomplete(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?}: {reason}")
            }
            ConfigError::Incomplete(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
}

fn minutes_in(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, ConfigError> {
    let value: Option<i64> = parsed(lookup, var)?;
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ConfigError::Invalid {
            var,
            value: v.to_string(),
            reason: format!("must be between {min} and {max} minutes"),
        }),
        other => Ok(other),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let max_connections =
            parsed(&lookup, "EASYSLOT_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "EASYSLOT_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let tls_cert = lookup("EASYSLOT_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("EASYSLOT_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Incomplete(
                "EASYSLOT_TLS_CERT and EASYSLOT_TLS_KEY must be set together",
            ));
        }

        let granularity =
            minutes_in(&lookup, "EASYSLOT_SLOT_GRANULARITY_MINUTES", 1, MINUTES_PER_DAY)?;
        let buffer_before =
            minutes_in(&lookup, "EASYSLOT_BUFFER_BEFORE_MINUTES", 0, MAX_BUFFER_MINUTES)?;
        let buffer_after =
            minutes_in(&lookup, "EASYSLOT_BUFFER_AFTER_MINUTES", 0, MAX_BUFFER_MINUTES)?;
        let slots = SlotConfig {
            granularity: granularity.unwrap_or(defaults.slots.granularity),
            buffer_before: buffer_before.unwrap_or(defaults.slots.buffer_before),
            buffer_after: buffer_after.unwrap_or(defaults.slots.buffer_after),
        };

        Ok(Self {
            bind: lookup("EASYSLOT_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "EASYSLOT_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("EASYSLOT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("EASYSLOT_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "EASYSLOT_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "EASYSLOT_METRICS_PORT")?,
            tls_cert,
            tls_key,
            slots,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
