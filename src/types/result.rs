use crate::db::value::Row;
use crate::error::DatabaseError;

/// The single payload a worker hands back to the host for one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncResult {
    Rows(Vec<Row>),
    RowCount(u64),
    Inserted {
        rows_affected: u64,
        last_insert_id: Option<i64>,
    },
    Error(DatabaseError),
}

impl AsyncResult {
    pub fn is_error(&self) -> bool {
        matches!(self, AsyncResult::Error(_))
    }

    pub fn into_rows(self) -> Result<Vec<Row>, DatabaseError> {
        match self {
            AsyncResult::Rows(rows) => Ok(rows),
            AsyncResult::Error(e) => Err(e),
            other => Err(unexpected("rows", &other)),
        }
    }

    pub fn into_row_count(self) -> Result<u64, DatabaseError> {
        match self {
            AsyncResult::RowCount(n) => Ok(n),
            AsyncResult::Inserted { rows_affected, .. } => Ok(rows_affected),
            AsyncResult::Error(e) => Err(e),
            other => Err(unexpected("row count", &other)),
        }
    }

    pub fn into_last_insert_id(self) -> Result<Option<i64>, DatabaseError> {
        match self {
            AsyncResult::Inserted { last_insert_id, .. } => Ok(last_insert_id),
            AsyncResult::RowCount(_) => Ok(None),
            AsyncResult::Error(e) => Err(e),
            other => Err(unexpected("insert id", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &AsyncResult) -> DatabaseError {
    let shape = match got {
        AsyncResult::Rows(_) => "rows",
        AsyncResult::RowCount(_) => "row count",
        AsyncResult::Inserted { .. } => "insert",
        AsyncResult::Error(_) => "error",
    };
    DatabaseError::new(format!("expected {wanted} from unit of work, got {shape}"))
}
