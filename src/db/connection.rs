//! Host-facing database connection.
//!
//! A `Connection` never holds a live handle. It holds the credentials needed
//! to open one, and every operation ships them to a worker with the work.

use crate::config::{Config, ConnectSettings};
use crate::db::credentials::{Credentials, DatabaseKind};
use crate::db::handle;
use crate::db::registry::QueryRegistry;
use crate::db::value::{Row, Value};
use crate::error::{DatabaseError, TickError};
use crate::service::dispatcher::Dispatcher;
use crate::service::resource_loader::QueryResources;
use crate::types::result::AsyncResult;
use crate::types::unit::{Statement, UnitOfWork, Work};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Template arguments: `(parameter name, value)` pairs.
pub type Args<'a> = &'a [(&'a str, &'a dyn Display)];

#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    credentials: Credentials,
    connect: ConnectSettings,
    registry: QueryRegistry,
    dispatcher: Dispatcher,
}

impl Connection {
    /// Build a connection and run every `__init` query, in resource order,
    /// before returning. Init failures are logged and do not abort.
    pub async fn open(
        credentials: Credentials,
        resources: &QueryResources,
        dispatcher: Dispatcher,
        connect: ConnectSettings,
    ) -> Self {
        let kind = credentials.kind();
        let registry = QueryRegistry::load(resources.for_kind(kind));
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                credentials,
                connect,
                registry,
                dispatcher,
            }),
        };

        let init: Vec<(String, String)> = conn
            .inner
            .registry
            .init_queries()
            .map(|t| (t.id.clone(), t.sql.clone()))
            .collect();
        for (id, sql) in init {
            match conn.execute_blocking(sql).await {
                Ok(rows) => info!(query = %id, rows, "init query applied"),
                Err(e) => error!(query = %id, error = %e, sql = ?e.sql, "init query failed"),
            }
        }

        info!(%kind, queries = conn.inner.registry.len(), "connection ready");
        conn
    }

    pub async fn from_config(config: &Config, dispatcher: Dispatcher) -> Result<Self, TickError> {
        let credentials = config.credentials()?;
        let resources = match &config.resource_dir {
            Some(dir) => QueryResources::load_from_dir(dir)?,
            None => QueryResources::default(),
        };
        Ok(Self::open(credentials, &resources, dispatcher, config.connect).await)
    }

    pub fn kind(&self) -> DatabaseKind {
        self.inner.credentials.kind()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn render(&self, id: &str, args: Args<'_>) -> Result<String, TickError> {
        self.inner.registry.render(id, args)
    }

    fn unit(&self, work: Work) -> UnitOfWork {
        UnitOfWork::new(self.inner.credentials.clone(), self.inner.connect, work)
    }

    /// Run one statement on the caller's task, bypassing the dispatcher.
    /// Meant for startup statements that must finish before anything else.
    pub async fn execute_blocking(&self, sql: impl Into<String>) -> Result<u64, DatabaseError> {
        self.unit(Work::Execute(Statement::raw(sql)))
            .run()
            .await
            .into_row_count()
    }

    /// Render a registered template and run it like [`Connection::execute_blocking`].
    pub async fn execute_blocking_query(&self, id: &str, args: Args<'_>) -> Result<u64, TickError> {
        let sql = self.render(id, args)?;
        Ok(self.execute_blocking(sql).await?)
    }

    /// Render a registered template and run it, reporting the affected row count.
    pub fn execute<F>(&self, id: &str, args: Args<'_>, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<u64, DatabaseError>) + Send + 'static,
    {
        let sql = self.render(id, args)?;
        self.execute_raw(sql, callback)
    }

    /// Render a registered template and collect its rows.
    pub fn fetch<F>(&self, id: &str, args: Args<'_>, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<Vec<Row>, DatabaseError>) + Send + 'static,
    {
        let sql = self.render(id, args)?;
        self.fetch_raw(sql, callback)
    }

    pub fn execute_raw<F>(&self, sql: impl Into<Statement>, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<u64, DatabaseError>) + Send + 'static,
    {
        self.submit(Work::Execute(sql.into()), move |r| callback(r.into_row_count()))
    }

    pub fn fetch_raw<F>(&self, sql: impl Into<Statement>, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<Vec<Row>, DatabaseError>) + Send + 'static,
    {
        self.submit(Work::Fetch(sql.into()), move |r| callback(r.into_rows()))
    }

    /// Run an insert and report the id generated for it on the same handle.
    pub(crate) fn insert_raw<F>(&self, stmt: Statement, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<Option<i64>, DatabaseError>) + Send + 'static,
    {
        self.submit(Work::Insert(stmt), move |r| callback(r.into_last_insert_id()))
    }

    /// Run all statements on one handle. A failure does not stop the rest;
    /// the first failure is reported, otherwise the total row count.
    pub fn batch_execute<I, S, F>(&self, statements: I, callback: F) -> Result<(), TickError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Statement>,
        F: FnOnce(Result<u64, DatabaseError>) + Send + 'static,
    {
        let stmts = statements.into_iter().map(Into::into).collect();
        self.submit(Work::Batch(stmts), move |r| callback(r.into_row_count()))
    }

    /// Like [`Connection::batch_execute`] with statements read from a
    /// `;`-separated file. The file is read inside the worker.
    pub fn batch_execute_file<F>(&self, path: impl Into<PathBuf>, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<u64, DatabaseError>) + Send + 'static,
    {
        self.submit(Work::BatchFile(path.into()), move |r| {
            callback(r.into_row_count())
        })
    }

    /// Live column names of `table`, in table order. Empty if it does not exist.
    pub fn introspect_columns<F>(&self, table: &str, callback: F) -> Result<(), TickError>
    where
        F: FnOnce(Result<Vec<String>, DatabaseError>) + Send + 'static,
    {
        let stmt = handle::introspection_sql(self.kind(), table);
        self.fetch_raw(stmt, move |rows| {
            callback(rows.map(|rows| {
                rows.into_iter()
                    .filter_map(|mut row| row.remove("name"))
                    .filter_map(|v| match v {
                        Value::Blob(bytes) => String::from_utf8(bytes).ok(),
                        other => other.into_string(),
                    })
                    .collect()
            }))
        })
    }

    fn submit<F>(&self, work: Work, on_complete: F) -> Result<(), TickError>
    where
        F: FnOnce(AsyncResult) + Send + 'static,
    {
        self.inner.dispatcher.submit(self.unit(work), on_complete)
    }
}
