use crate::error::TickError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_SQLITE_FILE: &str = "db.sqlite";
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    Sqlite,
    MySql,
}

impl DatabaseKind {
    /// Name of the query resource provisioned for this kind.
    pub fn resource_name(self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "sqlite.sql",
            DatabaseKind::MySql => "mysql.sql",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::MySql => "mysql",
        })
    }
}

/// Everything a worker needs to open its own handle. Never holds a live connection.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Sqlite {
        path: PathBuf,
    },
    MySql {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

impl Credentials {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Credentials::Sqlite { path: path.into() }
    }

    pub fn kind(&self) -> DatabaseKind {
        match self {
            Credentials::Sqlite { .. } => DatabaseKind::Sqlite,
            Credentials::MySql { .. } => DatabaseKind::MySql,
        }
    }

    /// Resolve the externally supplied `{type, config}` record. SQLite paths are
    /// taken relative to `data_dir`.
    pub fn from_record(record: &DatabaseRecord, data_dir: &Path) -> Result<Self, TickError> {
        let cfg = &record.config;
        match record.kind.trim().to_ascii_lowercase().as_str() {
            "sqlite" => {
                let file = cfg.path.as_deref().unwrap_or(DEFAULT_SQLITE_FILE);
                Ok(Credentials::Sqlite {
                    path: data_dir.join(file),
                })
            }
            "mysql" => Ok(Credentials::MySql {
                host: cfg.host.clone().ok_or(TickError::MissingCredential("host"))?,
                port: cfg.port.unwrap_or(DEFAULT_MYSQL_PORT),
                database: cfg
                    .database
                    .clone()
                    .ok_or(TickError::MissingCredential("dbname"))?,
                user: cfg
                    .user
                    .clone()
                    .ok_or(TickError::MissingCredential("username"))?,
                password: cfg.password.clone().unwrap_or_default(),
            }),
            other => Err(TickError::UnsupportedDatabaseKind(other.to_string())),
        }
    }

    /// Connection URL understood by `sqlx::AnyConnection`.
    pub fn connection_url(&self) -> Result<String, TickError> {
        match self {
            Credentials::Sqlite { path } => Ok(format!("sqlite://{}?mode=rwc", path.display())),
            Credentials::MySql {
                host,
                port,
                database,
                user,
                password,
            } => {
                let bad = |field: &'static str| TickError::invalid_value(field, "not URL safe");
                let mut url =
                    Url::parse("mysql://localhost").map_err(|e| TickError::invalid_value("host", e.to_string()))?;
                url.set_host(Some(host))
                    .map_err(|e| TickError::invalid_value("host", e.to_string()))?;
                url.set_port(Some(*port)).map_err(|_| bad("port"))?;
                url.set_username(user).map_err(|_| bad("username"))?;
                if !password.is_empty() {
                    url.set_password(Some(password))
                        .map_err(|_| bad("password"))?;
                }
                url.set_path(database);
                Ok(url.to_string())
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Credentials::MySql {
                host,
                port,
                database,
                user,
                ..
            } => f
                .debug_struct("MySql")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Credentials record as supplied by configuration: `{type, config: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: RecordConfig,
}

impl Default for DatabaseRecord {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            config: RecordConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, alias = "dbname", skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, alias = "username", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
