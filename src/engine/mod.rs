// AirDB Engine - Core module structure
pub mod adapter;
pub mod cli;
pub mod config;
pub mod hybrid;
pub mod nosql;

pub use config::Config;
pub use hybrid::Repository;
pub use nosql::NoSqlEngine;
