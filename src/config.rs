//! Layered configuration: compiled defaults, then a TOML file, then
//! `TICKDB_*` environment variables (`__` separates sections, e.g.
//! `TICKDB_DATABASE__TYPE=mysql`).

use crate::db::credentials::{Credentials, DatabaseRecord};
use crate::error::TickError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "TICKDB_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "tickdb.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub loglevel: String,
    /// Base directory for SQLite files.
    pub data_dir: PathBuf,
    /// Directory holding `sqlite.sql` / `mysql.sql`. No queries when unset.
    pub resource_dir: Option<PathBuf>,
    pub database: DatabaseRecord,
    pub connect: ConnectSettings,
    pub dispatch: DispatchSettings,
    pub orm: OrmSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            data_dir: PathBuf::from("data"),
            resource_dir: None,
            database: DatabaseRecord::default(),
            connect: ConnectSettings::default(),
            dispatch: DispatchSettings::default(),
            orm: OrmSettings::default(),
        }
    }
}

/// Retry policy for opening a handle inside a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectSettings {
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchSettings {
    /// Upper bound on units of work running at once. Unbounded when absent.
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Compare the stored `__version`; drop, recreate and migrate on mismatch.
    #[default]
    Versioned,
    /// Compare live column names and ALTER the difference in place.
    ColumnDiff,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrmSettings {
    pub policy: ReconcilePolicy,
    /// How long an operation may sit behind an in-flight reconciliation.
    pub wait_timeout_ms: Option<u64>,
}

impl OrmSettings {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    pub fn load() -> Result<Self, TickError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Ok(Self::figment(Toml::file(path)).extract()?)
    }

    /// Defaults overlaid with the given TOML text only; no environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, TickError> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()?)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
            .merge(Env::prefixed("TICKDB_").ignore(&["config"]).split("__"))
    }

    pub fn credentials(&self) -> Result<Credentials, TickError> {
        Credentials::from_record(&self.database, &self.data_dir)
    }
}
