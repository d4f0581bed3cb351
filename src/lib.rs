pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod server;
pub mod store;

// Re-export commonly used types for integration tests
pub use crate::config::Config;
pub use crate::driver::Driver;
pub use crate::error::{DriverError, DriverResult, ErrorKind};
pub use crate::server::{dispatch, Reply, Request};
