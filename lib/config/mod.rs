use std::env;

use thiserror::Error;

use crate::collection::{CollectionRef, DEFAULT_NAMESPACE};

pub const DEFAULT_CONFIG_TABLE: &str = "segmenter";
pub const DEFAULT_LOG_TABLE: &str = "segmenter_log";
pub const DEFAULT_POOL_SIZE: u32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL is required (env var or --database-url)")]
    MissingDatabaseUrl,
    #[error("invalid {name} `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Store connection URL. required.
    pub database_url: String,
    pub config_table: String,
    pub log_table: String,
    /// Namespace for bare table names, in the configuration table and here.
    pub default_namespace: String,
    pub pool_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads settings through `lookup` so callers can layer their own sources on top.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        let config_table =
            lookup("SEGMENTER_CONFIG_TABLE").unwrap_or_else(|| DEFAULT_CONFIG_TABLE.to_string());
        let log_table =
            lookup("SEGMENTER_LOG_TABLE").unwrap_or_else(|| DEFAULT_LOG_TABLE.to_string());
        let default_namespace = lookup("SEGMENTER_DEFAULT_NAMESPACE")
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let pool_size = match lookup("SEGMENTER_POOL_SIZE") {
            Some(raw) => parse_pool_size(&raw)?,
            None => DEFAULT_POOL_SIZE,
        };

        Ok(Self {
            database_url,
            config_table,
            log_table,
            default_namespace,
            pool_size,
        })
    }

    pub fn config_table_ref(&self) -> Result<CollectionRef, ConfigError> {
        table_ref("config table", &self.config_table, &self.default_namespace)
    }

    pub fn log_table_ref(&self) -> Result<CollectionRef, ConfigError> {
        table_ref("log table", &self.log_table, &self.default_namespace)
    }
}

pub fn parse_pool_size(raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ConfigError::Invalid {
            name: "pool size",
            value: raw.to_string(),
            reason: "expected a positive integer",
        }),
    }
}

fn table_ref(
    name: &'static str,
    raw: &str,
    default_namespace: &str,
) -> Result<CollectionRef, ConfigError> {
    CollectionRef::parse(raw, default_namespace).ok_or_else(|| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: "expected `namespace.table` or `table`",
    })
}
