//! Startup helpers: configuration discovery and validation.

pub mod config;

pub use config::{find_config_path, load_config};
