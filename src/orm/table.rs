//! Table model and the SQL the mapper issues against it.

use crate::db::credentials::DatabaseKind;
use crate::db::value::{Row, Value};
use crate::error::TickError;
use crate::orm::column::{Column, FieldDef, FieldKind, quote_ident};
use crate::types::unit::Statement;
use std::collections::HashSet;

/// Column holding the mapped version each row was written at.
pub const VERSION_COLUMN: &str = "__version";

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub version: String,
    columns: Vec<Column>,
    primary_key: Option<String>,
}

/// Column names to add and drop to turn a live table into the expected one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ColumnDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl Table {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            columns: Vec::new(),
            primary_key: None,
        }
    }

    pub fn add_column(&mut self, column: Column) -> Result<(), TickError> {
        if column.name == VERSION_COLUMN || self.column(&column.name).is_some() {
            return Err(TickError::DuplicateColumn {
                table: self.name.clone(),
                column: column.name,
            });
        }
        if column.primary_key {
            if let Some(existing) = &self.primary_key {
                return Err(TickError::DuplicatePrimaryKey {
                    table: self.name.clone(),
                    existing: existing.clone(),
                    duplicate: column.name,
                });
            }
            self.primary_key = Some(column.name.clone());
        }
        self.columns.push(column);
        Ok(())
    }

    /// Append the version column. Called once, after all fields.
    pub(crate) fn seal(&mut self) -> Result<(), TickError> {
        if self.primary_key.is_none() {
            return Err(TickError::MissingPrimaryKey(self.name.clone()));
        }
        let version = FieldDef::new(VERSION_COLUMN, FieldKind::Text)
            .size(36)
            .nullable()
            .default(self.version.clone());
        self.columns.push(version.to_column());
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.primary_key.as_deref().and_then(|pk| self.column(pk))
    }

    fn ident(&self) -> String {
        quote_ident(&self.name)
    }

    pub fn create_sql(&self, kind: DatabaseKind) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| c.render(kind)).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            self.ident(),
            columns.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.ident())
    }

    /// `condition` is spliced in verbatim after `WHERE`.
    pub fn select_all(&self, condition: Option<&str>) -> Statement {
        match condition.map(str::trim).filter(|c| !c.is_empty()) {
            Some(cond) => Statement::raw(format!("SELECT * FROM {} WHERE {cond}", self.ident())),
            None => Statement::raw(format!("SELECT * FROM {}", self.ident())),
        }
    }

    fn key_clause(&self) -> Result<String, TickError> {
        let pk = self
            .primary_key
            .as_deref()
            .ok_or_else(|| TickError::MissingPrimaryKey(self.name.clone()))?;
        Ok(format!("{} = ?", quote_ident(pk)))
    }

    pub fn select_by_key(&self, key: Value) -> Result<Statement, TickError> {
        Ok(Statement::with_params(
            format!("SELECT * FROM {} WHERE {}", self.ident(), self.key_clause()?),
            vec![key],
        ))
    }

    pub fn delete_by_key(&self, key: Value) -> Result<Statement, TickError> {
        Ok(Statement::with_params(
            format!("DELETE FROM {} WHERE {}", self.ident(), self.key_clause()?),
            vec![key],
        ))
    }

    pub fn insert(&self, row: Row) -> Statement {
        self.write("INSERT INTO", row)
    }

    pub fn replace(&self, row: Row) -> Statement {
        self.write("REPLACE INTO", row)
    }

    fn write(&self, verb: &str, row: Row) -> Statement {
        let (names, params): (Vec<String>, Vec<Value>) = row
            .into_iter()
            .map(|(column, value)| (quote_ident(&column), value))
            .unzip();
        let marks = vec!["?"; names.len()].join(", ");
        Statement::with_params(
            format!("{verb} {} ({}) VALUES ({marks})", self.ident(), names.join(", ")),
            params,
        )
    }

    pub fn diff_columns(&self, existing: &[String]) -> ColumnDiff {
        let live: HashSet<&str> = existing.iter().map(String::as_str).collect();
        let expected: HashSet<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        ColumnDiff {
            added: self
                .columns
                .iter()
                .filter(|c| !live.contains(c.name.as_str()))
                .map(|c| c.name.clone())
                .collect(),
            removed: existing
                .iter()
                .filter(|name| !expected.contains(name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// SQLite takes one action per `ALTER TABLE`; MySQL gets a single combined one.
    pub fn alter_sql(&self, kind: DatabaseKind, diff: &ColumnDiff) -> Vec<String> {
        let actions: Vec<String> = diff
            .added
            .iter()
            .filter_map(|name| self.column(name))
            .map(|col| format!("ADD COLUMN {}", col.render_added(kind)))
            .chain(
                diff.removed
                    .iter()
                    .map(|name| format!("DROP COLUMN {}", quote_ident(name))),
            )
            .collect();
        if actions.is_empty() {
            return Vec::new();
        }
        match kind {
            DatabaseKind::Sqlite => actions
                .into_iter()
                .map(|action| format!("ALTER TABLE {} {action};", self.ident()))
                .collect(),
            DatabaseKind::MySql => {
                vec![format!("ALTER TABLE {} {};", self.ident(), actions.join(", "))]
            }
        }
    }
}
