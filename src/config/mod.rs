//! Configuration Module
//!
//! Handles configuration loading, validation, and hot-reload.

pub mod manager;
pub mod types;
pub mod watcher;

pub use manager::ConfigManager;
pub use types::*;
pub use watcher::{ConfigChangeEvent, ConfigWatcher};
