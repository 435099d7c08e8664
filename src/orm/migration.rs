use crate::db::value::Row;
use std::fmt;

/// What to do with stored data when its version differs from the mapped one.
/// The plan is applied after the table has been dropped and recreated.
pub enum MigrationPlan {
    /// Statements run as one batch against the rebuilt table.
    Statements(Vec<String>),
    /// Applied to every row read before the rebuild. `Some(row)` is written
    /// back at the current version; `None` drops the row.
    Transform(Box<dyn Fn(Row) -> Option<Row> + Send + Sync>),
}

impl MigrationPlan {
    pub fn statements<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MigrationPlan::Statements(statements.into_iter().map(Into::into).collect())
    }

    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(Row) -> Option<Row> + Send + Sync + 'static,
    {
        MigrationPlan::Transform(Box::new(f))
    }
}

impl fmt::Debug for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPlan::Statements(stmts) => f.debug_tuple("Statements").field(stmts).finish(),
            MigrationPlan::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

/// Per-type migration logic.
pub trait Migrator: Send + Sync {
    fn plan(&self, from_version: &str, to_version: &str) -> MigrationPlan;
}

impl<F> Migrator for F
where
    F: Fn(&str, &str) -> MigrationPlan + Send + Sync,
{
    fn plan(&self, from_version: &str, to_version: &str) -> MigrationPlan {
        self(from_version, to_version)
    }
}
