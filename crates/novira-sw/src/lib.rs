//! # Novira Service Worker
//!
//! Offline cache router and worker lifecycle for the Novira PWA.
//!
//! ## Features
//!
//! - **Routing**: pure classification of GET requests into cache policies
//! - **Policies**: network-first auth, stale-while-revalidate data,
//!   cache-first static assets, navigation fallback to the cached root
//! - **Lifecycle**: precache on install, stale store cleanup and client claim
//!   on activate, `SKIP_WAITING` message handling
//! - **Registration**: installing / waiting / active bookkeeping and update
//!   checks against the deployed version
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing ─┐
//!     │       ├── waiting   ──┼── CacheWorker (one per version)
//!     │       └── active    ──┘       └── CacheRouter
//!     │                                     ├── RouteClassifier
//!     │                                     └── BackgroundTasks
//!     ├── Clients
//!     └── CacheStorage (shared by every version)
//! ```

use novira_common::NoviraError;
use novira_core::ConfigError;
use novira_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod container;
pub mod route;
pub mod router;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheError, CacheStorage, SharedCaches};
pub use container::{
    Client, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState, UpdateCheck,
};
pub use route::{RouteClassifier, RoutePolicy, UrlPattern};
pub use router::{BackgroundTasks, CacheRouter, FetchOutcome};
pub use worker::{CacheWorker, WorkerEvent, WorkerReply};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for NoviraError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::Cache(e) => e.into(),
            ServiceWorkerError::Config(e) => e.into(),
            ServiceWorkerError::NotFound(what) => NoviraError::NotFound(what),
            other => NoviraError::worker_with_source("service worker failure", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
