//! Runtime configuration, read from the environment.

use std::time::Duration;

use crate::reconcile::DEFAULT_INTERVAL;

pub const DEFAULT_ACCRUAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_uri: String,
    /// Base address of the accrual authority, without a trailing slash.
    pub accrual_address: String,
    pub poll_interval: Duration,
    pub accrual_timeout: Duration,
    pub max_connections: u32,
}

impl Config {
    /// `DATABASE_URI` and `ACCRUAL_SYSTEM_ADDRESS` are required. Empty
    /// values count as unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_uri = get("DATABASE_URI").ok_or(ConfigError::Missing("DATABASE_URI"))?;
        let accrual_address = get("ACCRUAL_SYSTEM_ADDRESS")
            .ok_or(ConfigError::Missing("ACCRUAL_SYSTEM_ADDRESS"))?
            .trim_end_matches('/')
            .to_string();

        let poll_interval = match get("ACCRUAL_POLL_INTERVAL_MS") {
            Some(v) => Duration::from_millis(parse_positive("ACCRUAL_POLL_INTERVAL_MS", &v)?),
            None => DEFAULT_INTERVAL,
        };
        let accrual_timeout = match get("ACCRUAL_TIMEOUT_MS") {
            Some(v) => Duration::from_millis(parse_positive("ACCRUAL_TIMEOUT_MS", &v)?),
            None => DEFAULT_ACCRUAL_TIMEOUT,
        };
        let max_connections = match get("DATABASE_MAX_CONNECTIONS") {
            Some(v) => u32::try_from(parse_positive("DATABASE_MAX_CONNECTIONS", &v)?).map_err(
                |_| ConfigError::Invalid {
                    name: "DATABASE_MAX_CONNECTIONS",
                    value: v.clone(),
                },
            )?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            database_uri,
            accrual_address,
            poll_interval,
            accrual_timeout,
            max_connections,
        })
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}
