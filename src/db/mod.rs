//! Database layer.
//!
//! - `credentials`: value-type credentials shipped to workers
//! - `registry`: named query templates parsed from a resource
//! - `handle`: opening a handle and running statements inside a worker
//! - `connection`: the host-facing execution primitives

pub mod connection;
pub mod credentials;
pub(crate) mod handle;
pub mod registry;
pub mod value;

pub use connection::Connection;
pub use credentials::{Credentials, DatabaseKind, DatabaseRecord};
pub use registry::{QueryRegistry, QueryTemplate};
pub use value::{Row, Value};
