//! # Novira Page
//!
//! Page-side companions of the service worker:
//!
//! - [`UpdateCoordinator`]: finds a waiting worker, shows a persistent
//!   upgrade prompt, sends `SKIP_WAITING` and reloads exactly once when the
//!   new worker takes control.
//! - [`SyncIndicator`]: a [`Fetcher`](novira_net::Fetcher) wrapper that
//!   raises a short-lived "syncing" signal whenever a data response was
//!   answered from the worker's cache.

pub mod sync_indicator;
pub mod updater;

pub use sync_indicator::SyncIndicator;
pub use updater::{
    forward_worker_events, ContainerHandle, PageEvent, PageHandle, RegistrationHandle,
    UpdateCoordinator, UpdateError, UpdatePrompt,
};
