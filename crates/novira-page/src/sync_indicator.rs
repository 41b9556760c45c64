//! Background sync indicator.
//!
//! Wraps the page's fetcher. A data response tagged `X-From-Cache: true`
//! means the worker answered from cache and is refreshing in the background,
//! so the signal goes up for a fixed display window. The window is a guess:
//! nothing reports when the refresh actually finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use http::Method;
use novira_core::SyncIndicatorConfig;
use novira_net::{Fetcher, NetError, Request, Response};
use tokio::sync::watch;
use tracing::{debug, trace};

struct SyncState {
    signal: watch::Sender<bool>,
    /// Bumped on every raise; only the latest timer may clear the signal.
    generation: AtomicU64,
    pathname: RwLock<String>,
}

/// [`Fetcher`] wrapper exposing the SyncSignal.
pub struct SyncIndicator<F> {
    inner: F,
    config: SyncIndicatorConfig,
    state: Arc<SyncState>,
}

impl<F: Fetcher> SyncIndicator<F> {
    pub fn new(inner: F, config: SyncIndicatorConfig) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner,
            config,
            state: Arc::new(SyncState {
                signal,
                generation: AtomicU64::new(0),
                pathname: RwLock::new("/".to_string()),
            }),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Whether a background refresh is believed to be running.
    pub fn is_syncing(&self) -> bool {
        *self.state.signal.borrow()
    }

    /// Whether the indicator should be drawn on the current page.
    pub fn is_visible(&self) -> bool {
        self.is_syncing() && !self.on_auth_page()
    }

    /// Watch the raw signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.signal.subscribe()
    }

    /// Record the page the user is on.
    pub fn set_pathname(&self, pathname: &str) {
        let mut current = self
            .state
            .pathname
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = pathname.to_string();
    }

    fn on_auth_page(&self) -> bool {
        let pathname = self
            .state
            .pathname
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.config.auth_pages.iter().any(|page| *page == *pathname)
    }

    fn watches(&self, request: &Request) -> bool {
        let url = request.url.as_str();
        request.method == Method::GET
            && url.contains(&self.config.data_host)
            && !url.contains(&self.config.auth_path)
    }

    fn raise(&self) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.signal.send_replace(true);
        debug!(generation, "Background sync started");

        let state = Arc::clone(&self.state);
        let display = self.config.display_duration();
        tokio::spawn(async move {
            tokio::time::sleep(display).await;
            if state.generation.load(Ordering::SeqCst) == generation {
                state.signal.send_replace(false);
                trace!(generation, "Background sync signal cleared");
            }
        });
    }
}

impl<F: Fetcher> Fetcher for SyncIndicator<F> {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            let watched = self.watches(&request);
            let response = self.inner.fetch(request).await?;
            if watched && response.is_from_cache() {
                self.raise();
            }
            Ok(response)
        })
    }
}
