//! One deployed worker version: install, activate, fetch and message handlers.

use std::sync::Arc;

use futures::future::try_join_all;
use novira_core::{RouteRules, WorkerConfig, WorkerMessage};
use novira_net::{Fetcher, Request};
use tracing::{debug, info};

use crate::cache::{CacheEntry, SharedCaches};
use crate::route::RouteClassifier;
use crate::router::{CacheRouter, FetchOutcome};
use crate::{Result, ServiceWorkerError};

/// Lifecycle and fetch events delivered to a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(String),
}

/// A worker's answer to a [`WorkerEvent`].
#[derive(Debug)]
pub enum WorkerReply {
    /// Precache done; `skip_waiting` asks the host to activate right away.
    Installed { skip_waiting: bool },
    /// Stale stores removed; the host should claim its clients.
    Activated { deleted: Vec<String> },
    Fetch(FetchOutcome),
    /// The page asked this worker to take over now.
    SkipWaiting,
    Ignored,
}

/// A single worker version.
pub struct CacheWorker {
    config: WorkerConfig,
    router: CacheRouter,
    caches: SharedCaches,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("version", &self.config.version)
            .field("store", &self.router.store_name())
            .finish()
    }
}

impl CacheWorker {
    pub fn new(
        config: WorkerConfig,
        rules: &RouteRules,
        caches: SharedCaches,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let router = CacheRouter::new(
            &config.store_name(),
            RouteClassifier::new(rules),
            Arc::clone(&caches),
            Arc::clone(&fetcher),
        );
        Self {
            config,
            router,
            caches,
            fetcher,
        }
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn store_name(&self) -> &str {
        self.router.store_name()
    }

    pub fn router(&self) -> &CacheRouter {
        &self.router
    }

    /// Dispatch an event to its handler.
    pub async fn handle_event(&self, event: WorkerEvent) -> Result<WorkerReply> {
        match event {
            WorkerEvent::Install => {
                let skip_waiting = self.install().await?;
                Ok(WorkerReply::Installed { skip_waiting })
            }
            WorkerEvent::Activate => Ok(WorkerReply::Activated {
                deleted: self.activate().await,
            }),
            WorkerEvent::Fetch(request) => {
                Ok(WorkerReply::Fetch(self.router.handle_fetch(request).await?))
            }
            WorkerEvent::Message(data) => Ok(match self.handle_message(&data) {
                Some(WorkerMessage::SkipWaiting) => WorkerReply::SkipWaiting,
                None => WorkerReply::Ignored,
            }),
        }
    }

    /// Fetch the precache manifest into a fresh store.
    ///
    /// All or nothing: one failed fetch or non-2xx response fails the
    /// install and stores nothing. Returns whether to skip waiting.
    pub async fn install(&self) -> Result<bool> {
        let urls = self.config.precache_urls()?;
        let store = self.config.store_name();
        info!(%store, count = urls.len(), "Installing worker");

        let fetched = try_join_all(urls.into_iter().map(|url| async move {
            let request = Request::get(url.clone());
            let key = request.cache_key();
            let response = self.fetcher.fetch(request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok((key, CacheEntry::from_response("GET", &response)))
        }))
        .await?;

        self.caches.write().await.open(&store).put_all(fetched)?;

        info!(%store, version = %self.config.version, "Worker installed");
        Ok(self.config.skip_waiting_on_install)
    }

    /// Delete every store but this version's. Returns the deleted names.
    pub async fn activate(&self) -> Vec<String> {
        let store = self.config.store_name();
        let mut caches = self.caches.write().await;
        caches.open(&store);
        let deleted = caches.retain_only(&store);
        for name in &deleted {
            info!(cache = %name, "Deleted stale cache");
        }
        deleted
    }

    /// Route an intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        self.router.handle_fetch(request).await
    }

    /// Decode a posted message; only `SKIP_WAITING` is understood.
    pub fn handle_message(&self, data: &str) -> Option<WorkerMessage> {
        let message = WorkerMessage::decode(data);
        match message {
            Some(WorkerMessage::SkipWaiting) => {
                info!(version = %self.config.version, "Skip waiting requested");
            }
            None => debug!(data, "Ignoring unknown worker message"),
        }
        message
    }

    /// Wait for in-flight background refreshes.
    pub async fn drain_background(&self) {
        let pending = self.router.background().pending();
        if pending > 0 {
            debug!(pending, "Draining background refreshes");
        }
        self.router.background().drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use novira_net::MockFetcher;

    fn worker(version: &str, caches: &SharedCaches, fetcher: &Arc<MockFetcher>) -> CacheWorker {
        let config = WorkerConfig {
            version: version.to_string(),
            origin: "https://app.test/".to_string(),
            ..Default::default()
        };
        CacheWorker::new(
            config,
            &RouteRules::default(),
            Arc::clone(caches),
            fetcher.clone(),
        )
    }

    fn serve_manifest(fetcher: &MockFetcher) {
        fetcher
            .respond("https://app.test/", 200, "<html>")
            .respond("https://app.test/Novira.png", 200, "png")
            .respond("https://app.test/manifest.json", 200, "{}");
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        serve_manifest(&fetcher);

        let worker = worker("v2.6.0", &caches, &fetcher);
        let skip = worker.install().await.unwrap();

        assert!(skip);
        let storage = caches.read().await;
        let cache = storage.get("novira-v2.6.0").unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.match_request("GET https://app.test/manifest.json").is_some());
    }

    #[tokio::test]
    async fn test_install_fails_on_missing_asset() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond("https://app.test/", 200, "<html>")
            .respond("https://app.test/manifest.json", 200, "{}");

        let worker = worker("v2.6.0", &caches, &fetcher);
        let err = worker.install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFailed { ref url, .. } if url.ends_with("/Novira.png")));
        assert!(!caches.read().await.has("novira-v2.6.0"));
    }

    #[tokio::test]
    async fn test_install_fails_offline() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_offline(true);

        let worker = worker("v2.6.0", &caches, &fetcher);
        assert!(worker.install().await.is_err());
    }

    #[tokio::test]
    async fn test_activate_leaves_only_current_store() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        {
            let mut storage = caches.write().await;
            storage.open("novira-v2.4.0");
            storage.open("novira-v2.5.0");
        }

        let worker = worker("v2.6.0", &caches, &fetcher);
        let mut deleted = worker.activate().await;
        deleted.sort();

        assert_eq!(deleted, vec!["novira-v2.4.0", "novira-v2.5.0"]);
        assert_eq!(caches.read().await.keys(), vec!["novira-v2.6.0"]);
    }

    #[tokio::test]
    async fn test_message_dispatch() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        let worker = worker("v2.6.0", &caches, &fetcher);

        let reply = worker
            .handle_event(WorkerEvent::Message(r#"{"type":"SKIP_WAITING"}"#.to_string()))
            .await
            .unwrap();
        assert!(matches!(reply, WorkerReply::SkipWaiting));

        let reply = worker
            .handle_event(WorkerEvent::Message(r#"{"type":"PING"}"#.to_string()))
            .await
            .unwrap();
        assert!(matches!(reply, WorkerReply::Ignored));
    }

    #[tokio::test]
    async fn test_fetch_event_routes() {
        let caches = CacheStorage::shared(1024);
        let fetcher = Arc::new(MockFetcher::new());
        serve_manifest(&fetcher);
        let worker = worker("v2.6.0", &caches, &fetcher);
        worker.install().await.unwrap();

        let request = Request::parse_get("https://app.test/Novira.png").unwrap();
        let reply = worker.handle_event(WorkerEvent::Fetch(request)).await.unwrap();
        match reply {
            WorkerReply::Fetch(FetchOutcome::Respond(response)) => {
                assert_eq!(response.text().unwrap(), "png");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        // Served from the precache, no second network hit.
        assert_eq!(fetcher.calls_to("https://app.test/Novira.png"), 1);
    }
}
