//! Per-policy request handlers.
//!
//! One handler per [`RoutePolicy`]; [`CacheRouter::handle_fetch`] picks the
//! handler from the classifier's verdict. Stale-while-revalidate refreshes
//! run as detached tasks in [`BackgroundTasks`]; the response path never
//! waits for them.

use std::future::Future;
use std::sync::{Arc, Mutex};

use http::Method;
use novira_net::{cache_key, Fetcher, Request, Response};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, SharedCaches};
use crate::route::{RouteClassifier, RoutePolicy};
use crate::Result;

/// What the router did with a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the request is handed back untouched.
    Passthrough(Request),
    /// Answered by the router.
    Respond(Response),
}

impl FetchOutcome {
    pub fn response(self) -> Option<Response> {
        match self {
            Self::Respond(response) => Some(response),
            Self::Passthrough(_) => None,
        }
    }
}

/// Detached tasks that outlive the request that started them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a task without waiting for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                // Reap finished tasks so the set does not grow unbounded.
                while tasks.try_join_next().is_some() {}
                tasks.spawn(task);
            }
            Err(_) => {
                tokio::spawn(task);
            }
        }
    }

    /// Number of tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Wait for every task started so far.
    pub async fn drain(&self) {
        loop {
            let mut tasks = match self.tasks.lock() {
                Ok(mut guard) => std::mem::take(&mut *guard),
                Err(_) => return,
            };
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task did not complete");
                }
            }
        }
    }
}

/// Routes intercepted requests between the cache and the network.
pub struct CacheRouter {
    store_name: Arc<str>,
    classifier: RouteClassifier,
    caches: SharedCaches,
    fetcher: Arc<dyn Fetcher>,
    background: BackgroundTasks,
}

impl CacheRouter {
    pub fn new(
        store_name: &str,
        classifier: RouteClassifier,
        caches: SharedCaches,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            store_name: Arc::from(store_name),
            classifier,
            caches,
            fetcher,
            background: BackgroundTasks::new(),
        }
    }

    /// Store this router writes into.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn classify(&self, request: &Request) -> RoutePolicy {
        self.classifier.classify_request(request)
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Route one request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        let policy = self.classify(&request);
        debug!(url = %request.url, method = %request.method, %policy, "Routing request");

        let response = match policy {
            RoutePolicy::Unhandled => return Ok(FetchOutcome::Passthrough(request)),
            RoutePolicy::AuthPassthrough => self.network_first(request).await?,
            RoutePolicy::DataRevalidate => self.stale_while_revalidate(request).await?,
            RoutePolicy::StaticCacheFirst => self.cache_first(request).await?,
            RoutePolicy::NavigationFallback => self.navigation(request).await?,
        };
        Ok(FetchOutcome::Respond(response))
    }

    /// Network first; cache only when the network is gone. Never writes.
    async fn network_first(&self, request: Request) -> Result<Response> {
        let key = request.cache_key();
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let cached = self
                    .caches
                    .read()
                    .await
                    .match_request(&key)
                    .map(CacheEntry::to_response);
                match cached {
                    Some(response) => {
                        warn!(%key, error = %err, "Auth request failed, serving cached copy");
                        Ok(response)
                    }
                    None => Err(err.into()),
                }
            }
        }
    }

    /// Answer from the current store if possible, refresh in the background.
    async fn stale_while_revalidate(&self, request: Request) -> Result<Response> {
        let key = request.cache_key();
        let cached = self
            .caches
            .read()
            .await
            .match_in(&self.store_name, &key)
            .map(CacheEntry::to_response);

        if let Some(cached) = cached {
            debug!(%key, "Serving data from cache, revalidating");
            self.spawn_refresh(request);
            return Ok(cached.marked_from_cache());
        }

        let response = self.fetcher.fetch(request).await?;
        if response.ok() {
            store_response(&self.caches, &self.store_name, &key, &response).await;
        }
        Ok(response)
    }

    /// Cache first; network and store on a miss.
    async fn cache_first(&self, request: Request) -> Result<Response> {
        let key = request.cache_key();
        let cached = self
            .caches
            .read()
            .await
            .match_request(&key)
            .map(CacheEntry::to_response);

        if let Some(cached) = cached {
            return Ok(cached);
        }

        let response = self.fetcher.fetch(request).await?;
        if response.ok() {
            store_response(&self.caches, &self.store_name, &key, &response).await;
        }
        Ok(response)
    }

    /// Cached document now and a background refresh; otherwise the network,
    /// then the cached site root.
    async fn navigation(&self, request: Request) -> Result<Response> {
        let key = request.cache_key();
        let cached = self
            .caches
            .read()
            .await
            .match_request(&key)
            .map(CacheEntry::to_response);

        if let Some(cached) = cached {
            self.spawn_refresh(request);
            return Ok(cached);
        }

        let root_key = request
            .url
            .join("/")
            .ok()
            .map(|root| cache_key(&Method::GET, &root));

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    store_response(&self.caches, &self.store_name, &key, &response).await;
                }
                Ok(response)
            }
            Err(err) => {
                let caches = self.caches.read().await;
                match root_key.as_deref().and_then(|k| caches.match_request(k)) {
                    Some(root) => {
                        info!(%key, error = %err, "Navigation offline, serving cached root");
                        Ok(root.to_response())
                    }
                    None => Err(err.into()),
                }
            }
        }
    }

    fn spawn_refresh(&self, request: Request) {
        let fetcher = Arc::clone(&self.fetcher);
        let caches = Arc::clone(&self.caches);
        let store = Arc::clone(&self.store_name);

        self.background.spawn(async move {
            let key = request.cache_key();
            match fetcher.fetch(request).await {
                Ok(response) if response.ok() => {
                    store_response(&caches, &store, &key, &response).await;
                    debug!(%key, "Background refresh stored");
                }
                Ok(response) => {
                    debug!(%key, status = %response.status, "Background refresh not stored");
                }
                Err(e) => {
                    debug!(%key, error = %e, "Background refresh failed");
                }
            }
        });
    }
}

/// Write a response into an existing store. Failures are logged, not raised.
async fn store_response(caches: &SharedCaches, store: &str, key: &str, response: &Response) {
    let entry = CacheEntry::from_response(Method::GET.as_str(), response);
    let mut caches = caches.write().await;
    match caches.get_mut(store) {
        Some(cache) => {
            if let Err(e) = cache.put(key, entry) {
                warn!(%store, error = %e, "Cache write failed");
            }
        }
        None => warn!(%store, %key, "Cache store unavailable, response not stored"),
    }
}
