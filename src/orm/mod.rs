//! Minimal object mapper.
//!
//! - `column` / `table`: the schema model and the SQL rendered from it
//! - `mapping`: explicit field bindings for a mapped type
//! - `codec`: canonical encodings and read coercion
//! - `migration`: per-type migration plans
//! - `reconcile`: bringing a live table in line with its mapping
//! - `mapper`: per-type state machine and the public operations

pub mod codec;
pub mod column;
pub mod mapper;
pub mod mapping;
pub mod migration;
pub(crate) mod reconcile;
pub mod table;

pub use column::{Column, FieldDef, FieldKind};
pub use mapper::{MappingState, ObjectRelationalMapper};
pub use mapping::{Mapped, TableBuilder, TableMapping};
pub use migration::{MigrationPlan, Migrator};
pub use table::{ColumnDiff, Table, VERSION_COLUMN};

use parking_lot::Mutex;
use std::sync::Arc;

/// A callback several continuations may race to; only the first call runs it.
pub(crate) struct OnceCallback<A>(Arc<Mutex<Option<Box<dyn FnOnce(A) + Send>>>>);

impl<A> Clone for OnceCallback<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A> OnceCallback<A> {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(A) + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::new(f)))))
    }

    pub(crate) fn call(&self, arg: A) {
        let f = self.0.lock().take();
        if let Some(f) = f {
            f(arg);
        }
    }
}
