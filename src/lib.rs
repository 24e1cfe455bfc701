pub mod config;
pub mod logger;

pub use container_bus;
