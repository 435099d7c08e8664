use crate::db::credentials::DatabaseKind;
use crate::error::TickError;
use std::{fs, path::Path};
use tracing::{info, warn};

/// The per-dialect query resources handed to a connection at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResources {
    pub sqlite: Option<String>,
    pub mysql: Option<String>,
}

impl QueryResources {
    pub fn new(sqlite: Option<String>, mysql: Option<String>) -> Self {
        Self { sqlite, mysql }
    }

    pub fn for_kind(&self, kind: DatabaseKind) -> Option<&str> {
        match kind {
            DatabaseKind::Sqlite => self.sqlite.as_deref(),
            DatabaseKind::MySql => self.mysql.as_deref(),
        }
    }

    /// Read `sqlite.sql` and `mysql.sql` from `dir`. Missing files are not errors.
    pub fn load_from_dir(dir: &Path) -> Result<Self, TickError> {
        if !dir.exists() {
            info!(path = %dir.display(), "resource directory not found; no predefined queries");
            return Ok(Self::default());
        }

        Ok(Self {
            sqlite: read_resource(dir, DatabaseKind::Sqlite)?,
            mysql: read_resource(dir, DatabaseKind::MySql)?,
        })
    }
}

fn read_resource(dir: &Path, kind: DatabaseKind) -> Result<Option<String>, TickError> {
    let path = dir.join(kind.resource_name());
    if !path.is_file() {
        warn!(path = %path.display(), %kind, "query resource missing");
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    info!(path = %path.display(), %kind, bytes = text.len(), "query resource loaded");
    Ok(Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_present_resources_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sqlite.sql"), "-- a() { SELECT 1 }").unwrap();

        let res = QueryResources::load_from_dir(dir.path()).unwrap();
        assert_eq!(res.for_kind(DatabaseKind::Sqlite), Some("-- a() { SELECT 1 }"));
        assert_eq!(res.for_kind(DatabaseKind::MySql), None);
    }

    #[test]
    fn missing_directory_is_empty() {
        let res = QueryResources::load_from_dir(Path::new("/nonexistent/tickdb/res")).unwrap();
        assert_eq!(res, QueryResources::default());
    }
}
