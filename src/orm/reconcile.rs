//! Bringing a live table in line with its mapping.
//!
//! Every step submits one unit of work and continues from its callback, so
//! the whole sequence runs on the host thread without blocking it.

use crate::config::ReconcilePolicy;
use crate::db::connection::Connection;
use crate::db::value::Row;
use crate::error::{DatabaseError, TickError};
use crate::orm::OnceCallback;
use crate::orm::codec;
use crate::orm::migration::{MigrationPlan, Migrator};
use crate::orm::table::{Table, VERSION_COLUMN};
use crate::types::unit::Statement;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) type Outcome = Result<(), TickError>;

pub(crate) struct Reconciliation {
    pub conn: Connection,
    pub table: Table,
    pub migrator: Option<Arc<dyn Migrator>>,
    pub done: OnceCallback<Outcome>,
}

type Job = Arc<Reconciliation>;

impl Reconciliation {
    /// Submission failures end the reconciliation right away.
    fn guard(&self, submitted: Result<(), TickError>) {
        if let Err(e) = submitted {
            self.done.call(Err(e));
        }
    }

    fn complete(&self, result: Result<u64, DatabaseError>) {
        self.done.call(result.map(|_| ()).map_err(TickError::from));
    }
}

pub(crate) fn start(policy: ReconcilePolicy, job: Reconciliation) {
    let job = Arc::new(job);
    match policy {
        ReconcilePolicy::Versioned => versioned(job),
        ReconcilePolicy::ColumnDiff => column_diff(job),
    }
}

fn versioned(job: Job) {
    let next = job.clone();
    let probe = job.table.select_all(None);
    job.guard(job.conn.fetch_raw(probe, move |probed| match probed {
        Err(e) => {
            debug!(table = %next.table.name, error = %e, "probe failed; creating table");
            create(next);
        }
        Ok(rows) if rows.is_empty() => rebuild(next, None),
        Ok(rows) => {
            let stored = rows[0]
                .get(VERSION_COLUMN)
                .cloned()
                .and_then(|v| v.into_string())
                .unwrap_or_default();
            let current = next.table.version.clone();
            if stored == current {
                debug!(table = %next.table.name, version = %current, "stored version matches");
                next.done.call(Ok(()));
                return;
            }
            let Some(migrator) = next.migrator.clone() else {
                next.done.call(Err(TickError::MissingMigrator {
                    table: next.table.name.clone(),
                    stored,
                    current,
                }));
                return;
            };
            info!(
                table = %next.table.name,
                from = %stored,
                to = %current,
                rows = rows.len(),
                "migrating table"
            );
            let plan = migrator.plan(&stored, &current);
            rebuild(next, Some((plan, rows)));
        }
    }));
}

fn create(job: Job) {
    let next = job.clone();
    let sql = job.table.create_sql(job.conn.kind());
    job.guard(job.conn.execute_raw(sql, move |r| next.complete(r)));
}

/// Drop and recreate, then apply the migration if there is one.
fn rebuild(job: Job, migration: Option<(MigrationPlan, Vec<Row>)>) {
    let next = job.clone();
    let statements = [job.table.drop_sql(), job.table.create_sql(job.conn.kind())];
    job.guard(job.conn.batch_execute(statements, move |rebuilt| {
        if let Err(e) = rebuilt {
            next.done.call(Err(e.into()));
            return;
        }
        let statements: Vec<Statement> = match migration {
            None => Vec::new(),
            Some((MigrationPlan::Statements(stmts), _)) => {
                stmts.into_iter().map(Statement::raw).collect()
            }
            Some((MigrationPlan::Transform(transform), rows)) => rows
                .into_iter()
                .filter_map(|row| transform(row))
                .map(|row| next.table.insert(restamp(&next.table, row)))
                .collect(),
        };
        if statements.is_empty() {
            next.done.call(Ok(()));
            return;
        }
        debug!(table = %next.table.name, statements = statements.len(), "applying migration");
        let after = next.clone();
        next.guard(next.conn.batch_execute(statements, move |r| after.complete(r)));
    }));
}

/// Keep only columns the rebuilt table has and stamp the current version.
fn restamp(table: &Table, row: Row) -> Row {
    let mut out: Row = row
        .into_iter()
        .filter(|(column, _)| column != VERSION_COLUMN && table.column(column).is_some())
        .map(|(column, value)| (column, codec::encode_for_write(value)))
        .collect();
    out.insert(VERSION_COLUMN, table.version.clone());
    out
}

fn column_diff(job: Job) {
    let next = job.clone();
    let name = job.table.name.clone();
    job.guard(job.conn.introspect_columns(&name, move |live| {
        let live = match live {
            Ok(live) => live,
            Err(e) => {
                next.done.call(Err(e.into()));
                return;
            }
        };
        if live.is_empty() {
            create(next);
            return;
        }
        let diff = next.table.diff_columns(&live);
        if diff.is_empty() {
            next.done.call(Ok(()));
            return;
        }
        info!(
            table = %next.table.name,
            added = ?diff.added,
            removed = ?diff.removed,
            "altering table"
        );
        let statements = next.table.alter_sql(next.conn.kind(), &diff);
        let after = next.clone();
        next.guard(next.conn.batch_execute(statements, move |r| after.complete(r)));
    }));
}
