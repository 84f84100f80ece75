pub mod config;
pub use config::*;

#[allow(clippy::module_inception)]
pub mod manager;
pub use manager::*;
