//! Novira Core Library
//!
//! This crate provides shared types, errors, and configuration for the
//! Novira offline layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    NetConfig, NoviraConfig, RouteRules, SyncIndicatorConfig, UpdaterConfig, WorkerConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use types::{RequestMode, VersionState, WorkerMessage, CACHE_MARKER_HEADER};
