pub mod result;
pub mod unit;

pub use result::AsyncResult;
pub use unit::{Statement, UnitOfWork, Work};
