use crate::config::ConnectSettings;
use crate::db::credentials::Credentials;
use crate::db::handle;
use crate::db::value::Value;
use crate::error::DatabaseError;
use crate::types::result::AsyncResult;
use std::path::PathBuf;
use tracing::debug;

/// SQL text plus positional parameters bound with `?`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::raw(sql)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::raw(sql)
    }
}

#[derive(Debug, Clone)]
pub enum Work {
    /// One statement; yields the affected row count.
    Execute(Statement),
    /// One statement; yields every result row.
    Fetch(Statement),
    /// One statement; yields the id generated on the same handle.
    Insert(Statement),
    /// Sequential statements on one handle. Keeps going past failures and
    /// reports the first one.
    Batch(Vec<Statement>),
    /// Like `Batch`, with statements read from a `;`-separated file.
    BatchFile(PathBuf),
}

/// A self-contained piece of database work: everything needed to reopen a
/// handle travels with it by value.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub credentials: Credentials,
    pub connect: ConnectSettings,
    pub work: Work,
}

impl UnitOfWork {
    pub fn new(credentials: Credentials, connect: ConnectSettings, work: Work) -> Self {
        Self {
            credentials,
            connect,
            work,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self.work {
            Work::Execute(_) => "execute",
            Work::Fetch(_) => "fetch",
            Work::Insert(_) => "insert",
            Work::Batch(_) => "batch",
            Work::BatchFile(_) => "batch-file",
        }
    }

    /// Run to completion. Every failure is folded into `AsyncResult::Error`.
    pub async fn run(self) -> AsyncResult {
        let statements = match self.work {
            Work::BatchFile(path) => match read_batch_file(&path).await {
                Ok(stmts) => Work::Batch(stmts),
                Err(e) => return AsyncResult::Error(e),
            },
            other => other,
        };

        let mut conn = match handle::open(&self.credentials, &self.connect).await {
            Ok(conn) => conn,
            Err(e) => return AsyncResult::Error(e),
        };

        let result = match &statements {
            Work::Execute(stmt) => match handle::execute(&mut conn, stmt).await {
                Ok(done) => AsyncResult::RowCount(done.rows_affected()),
                Err(e) => AsyncResult::Error(e),
            },
            Work::Fetch(stmt) => match handle::fetch(&mut conn, stmt).await {
                Ok(rows) => AsyncResult::Rows(rows),
                Err(e) => AsyncResult::Error(e),
            },
            Work::Insert(stmt) => match handle::execute(&mut conn, stmt).await {
                Ok(done) => {
                    let last_insert_id = match done.last_insert_id() {
                        Some(id) => Ok(Some(id)),
                        None => handle::generated_key(&mut conn, self.credentials.kind()).await,
                    };
                    match last_insert_id {
                        Ok(last_insert_id) => AsyncResult::Inserted {
                            rows_affected: done.rows_affected(),
                            last_insert_id,
                        },
                        Err(e) => AsyncResult::Error(e),
                    }
                }
                Err(e) => AsyncResult::Error(e),
            },
            Work::Batch(stmts) => {
                let mut total = 0u64;
                let mut first_error = None;
                for stmt in stmts {
                    match handle::execute(&mut conn, stmt).await {
                        Ok(done) => total += done.rows_affected(),
                        Err(e) => {
                            debug!(sql = %stmt.sql, error = %e, "batch statement failed; continuing");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) => AsyncResult::Error(e),
                    None => AsyncResult::RowCount(total),
                }
            }
            Work::BatchFile(_) => AsyncResult::Error(DatabaseError::new("unexpanded batch file")),
        };

        handle::close(conn).await;
        result
    }
}

/// Split a script on `;`, dropping blank statements.
pub fn split_statements(script: &str) -> Vec<Statement> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Statement::raw)
        .collect()
}

async fn read_batch_file(path: &PathBuf) -> Result<Vec<Statement>, DatabaseError> {
    let script = tokio::fs::read_to_string(path).await.map_err(|e| {
        DatabaseError::new(format!("failed to read batch file {}: {e}", path.display()))
    })?;
    Ok(split_statements(&script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_blank_statements() {
        let stmts = split_statements("CREATE TABLE a(x INT);\n\n INSERT INTO a VALUES (1) ;;");
        let sql: Vec<_> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql, vec!["CREATE TABLE a(x INT)", "INSERT INTO a VALUES (1)"]);
    }
}
