pub mod dispatcher;
pub mod resource_loader;

pub use dispatcher::{Dispatcher, HostTask};
pub use resource_loader::QueryResources;
