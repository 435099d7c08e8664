pub mod config;
pub mod db;
pub mod error;
pub mod orm;
pub mod service;
pub mod types;

pub use config::Config;
pub use db::{Connection, Credentials, DatabaseKind, Row, Value};
pub use error::{DatabaseError, TickError};
pub use orm::{FieldDef, FieldKind, Mapped, MappingState, ObjectRelationalMapper, TableBuilder};
pub use service::{Dispatcher, QueryResources};
pub use types::AsyncResult;
