//! Registration and lifecycle host.
//!
//! Plays the browser's part: keeps the installing / waiting / active slots,
//! runs install and activate on the right [`CacheWorker`], claims clients
//! and reports every transition on an event channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use novira_core::{NoviraConfig, RouteRules, VersionState, WorkerConfig, WorkerMessage};
use novira_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, SharedCaches};
use crate::router::FetchOutcome;
use crate::worker::CacheWorker;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    /// Allocate a fresh ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceWorkerState {
    /// Initial state, not yet installing.
    #[default]
    Parsed,
    /// Installing (precache running).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (stale stores being removed).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker slot entry.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    worker: Arc<CacheWorker>,
}

impl ServiceWorker {
    fn new(worker: CacheWorker) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            worker: Arc::new(worker),
        }
    }

    /// Deployed version this worker runs.
    pub fn version(&self) -> &str {
        self.worker.version()
    }

    pub fn worker(&self) -> &Arc<CacheWorker> {
        &self.worker
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Where the active and newer versions stand.
    pub fn version_state(&self) -> VersionState {
        match (&self.active, &self.waiting) {
            (_, Some(waiting)) if waiting.state == ServiceWorkerState::Activating => {
                VersionState::Activating
            }
            (Some(_), Some(_)) => VersionState::WaitingForActivation,
            (Some(_), None) => VersionState::ActiveOnly,
            (None, _) => VersionState::NoWorker,
        }
    }

    /// Whether `version` is already installing, waiting or active.
    pub fn knows_version(&self, version: &str) -> bool {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|w| w.version() == version)
    }

    fn find(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// Transition installing to waiting. Returns the worker it displaced.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let displaced = self.waiting.replace(worker);
        displaced.map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Promote the waiting worker. Returns the new active and the old one.
    pub fn promote_waiting(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activated);

        let old = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        self.active = Some(worker.clone());
        Some((worker, old))
    }

    /// Unregister (mark everything redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}

// ==================== Clients ====================

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker controlling this page, if any.
    pub controller: Option<ServiceWorkerId>,
}

// ==================== Events ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    /// The deployed version is already known.
    UpToDate,
    /// A new version installed and is waiting.
    Waiting(ServiceWorkerId),
    /// A new version installed and took control.
    Activated(ServiceWorkerId),
}

// ==================== Container ====================

/// Service worker container (navigator.serviceWorker plus the browser side).
pub struct ServiceWorkerContainer {
    scope: Url,
    routes: RouteRules,
    registration: Arc<RwLock<Option<ServiceWorkerRegistration>>>,

    /// Latest worker version available from the server.
    deployed: Arc<RwLock<Option<WorkerConfig>>>,

    caches: SharedCaches,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<HashMap<String, Client>>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        config: &NoviraConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scope = config.worker.origin_url()?;

        Ok((
            Self {
                scope,
                routes: config.routes.clone(),
                registration: Arc::new(RwLock::new(None)),
                deployed: Arc::new(RwLock::new(None)),
                caches: CacheStorage::shared(config.worker.max_entry_bytes),
                fetcher,
                clients: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn caches(&self) -> &SharedCaches {
        &self.caches
    }

    /// Names of every cache store, oldest first.
    pub async fn cache_names(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Publish a worker version for the next update check to find.
    pub async fn deploy(&self, config: WorkerConfig) {
        info!(version = %config.version, "Worker version deployed");
        *self.deployed.write().await = Some(config);
    }

    /// Deploy and install in one step.
    pub async fn register(&self, config: WorkerConfig) -> Result<UpdateCheck> {
        self.deploy(config).await;
        self.update().await
    }

    /// Check the deployed version and install it if it is new.
    pub async fn update(&self) -> Result<UpdateCheck> {
        let config = self
            .deployed
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceWorkerError::NotFound("no deployed worker".to_string()))?;

        let known = {
            let mut registration = self.registration.write().await;
            let registration =
                registration.get_or_insert_with(|| ServiceWorkerRegistration::new(self.scope.clone()));
            registration.last_update_check = Some(Instant::now());
            registration.knows_version(&config.version)
        };

        if known {
            debug!(version = %config.version, "Worker up to date");
            return Ok(UpdateCheck::UpToDate);
        }

        self.install(config).await
    }

    async fn install(&self, config: WorkerConfig) -> Result<UpdateCheck> {
        let version = config.version.clone();
        let worker = CacheWorker::new(
            config,
            &self.routes,
            Arc::clone(&self.caches),
            Arc::clone(&self.fetcher),
        );

        let installing = {
            let mut guard = self.registration.write().await;
            let registration =
                guard.get_or_insert_with(|| ServiceWorkerRegistration::new(self.scope.clone()));
            let mut installing = ServiceWorker::new(worker);
            installing.set_state(ServiceWorkerState::Installing);
            registration.installing = Some(installing.clone());
            installing
        };

        self.emit(ServiceWorkerEvent::UpdateFound {
            version: version.clone(),
        });
        self.emit_state(&installing);

        let skip_waiting = match installing.worker().install().await {
            Ok(skip) => skip,
            Err(e) => {
                warn!(%version, error = %e, "Worker install failed");
                let mut guard = self.registration.write().await;
                if let Some(registration) = guard.as_mut() {
                    if let Some(mut failed) = registration.installing.take() {
                        failed.set_state(ServiceWorkerState::Redundant);
                        self.emit_state(&failed);
                    }
                }
                return Err(e);
            }
        };

        let (waiting, has_active) = {
            let mut guard = self.registration.write().await;
            let registration = guard
                .as_mut()
                .ok_or_else(|| ServiceWorkerError::StateError("registration removed".to_string()))?;
            if let Some(displaced) = registration.install_complete() {
                self.emit_state(&displaced);
            }
            let waiting = registration
                .waiting
                .clone()
                .ok_or_else(|| ServiceWorkerError::StateError("installed worker vanished".to_string()))?;
            (waiting, registration.active.is_some())
        };
        self.emit_state(&waiting);

        if !has_active || skip_waiting {
            self.activate_waiting().await?;
            return Ok(UpdateCheck::Activated(waiting.id));
        }

        info!(%version, "New worker waiting for activation");
        Ok(UpdateCheck::Waiting(waiting.id))
    }

    /// Activate the waiting worker and claim every client.
    ///
    /// Returns `false` when there is nothing to activate or an activation is
    /// already running.
    pub async fn activate_waiting(&self) -> Result<bool> {
        let activating = {
            let mut guard = self.registration.write().await;
            let Some(waiting) = guard.as_mut().and_then(|r| r.waiting.as_mut()) else {
                return Ok(false);
            };
            if waiting.state == ServiceWorkerState::Activating {
                return Ok(false);
            }
            waiting.set_state(ServiceWorkerState::Activating);
            waiting.clone()
        };
        self.emit_state(&activating);

        activating.worker().activate().await;

        let (active, old) = {
            let mut guard = self.registration.write().await;
            guard
                .as_mut()
                .and_then(|r| r.promote_waiting())
                .ok_or_else(|| ServiceWorkerError::StateError("waiting worker vanished".to_string()))?
        };
        if let Some(old) = old {
            self.emit_state(&old);
        }
        self.emit_state(&active);
        info!(version = %active.version(), "Worker activated");

        self.claim(active.id).await;
        Ok(true)
    }

    /// Make `worker_id` the controller of every client.
    async fn claim(&self, worker_id: ServiceWorkerId) {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            if client.controller != Some(worker_id) {
                client.controller = Some(worker_id);
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id: client.id.clone(),
                    worker_id,
                });
            }
        }
    }

    /// Post a message to a worker.
    pub async fn post_message(&self, target: ServiceWorkerId, data: &str) -> Result<()> {
        let (worker, is_waiting) = {
            let guard = self.registration.read().await;
            let registration = guard
                .as_ref()
                .ok_or_else(|| ServiceWorkerError::NotFound("registration".to_string()))?;
            let worker = registration
                .find(target)
                .cloned()
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("worker {target:?}")))?;
            let is_waiting = registration.waiting.as_ref().is_some_and(|w| w.id == target);
            (worker, is_waiting)
        };

        if worker.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }

        if let Some(WorkerMessage::SkipWaiting) = worker.worker().handle_message(data) {
            if is_waiting {
                self.activate_waiting().await?;
            }
        }
        Ok(())
    }

    /// Waiting worker, if any.
    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.waiting.as_ref().map(|w| w.id))
    }

    /// Active worker, if any.
    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.active.clone())
    }

    pub async fn version_state(&self) -> VersionState {
        self.registration
            .read()
            .await
            .as_ref()
            .map(|r| r.version_state())
            .unwrap_or_default()
    }

    /// Whether a registration exists.
    pub async fn has_registration(&self) -> bool {
        self.registration.read().await.is_some()
    }

    /// Open a page. It is controlled by the active worker, if there is one.
    pub async fn connect_client(&self, url: Url) -> String {
        let controller = self.active().await.map(|w| w.id);
        let id = format!("client-{}", NEXT_CLIENT.fetch_add(1, Ordering::Relaxed));
        let client = Client {
            id: id.clone(),
            url,
            controller,
        };
        self.clients.write().await.insert(id.clone(), client);
        id
    }

    /// Close a page.
    pub async fn disconnect_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Controller of a page.
    pub async fn controller_of(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|c| c.controller)
    }

    /// Route a request through the active worker.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        match self.active().await {
            Some(active) => active.worker().handle_fetch(request).await,
            None => Ok(FetchOutcome::Passthrough(request)),
        }
    }

    /// Wait for background refreshes of the active and waiting workers.
    pub async fn drain_background(&self) {
        let workers: Vec<Arc<CacheWorker>> = {
            let guard = self.registration.read().await;
            guard
                .as_ref()
                .map(|r| {
                    [&r.active, &r.waiting]
                        .into_iter()
                        .flatten()
                        .map(|w| Arc::clone(w.worker()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for worker in workers {
            worker.drain_background().await;
        }
    }

    /// Unregister a service worker.
    pub async fn unregister(&self) -> bool {
        let removed = self.registration.write().await.take();
        match removed {
            Some(mut registration) => {
                registration.unregister();
                let mut clients = self.clients.write().await;
                for client in clients.values_mut() {
                    client.controller = None;
                }
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            version: worker.version().to_string(),
            new_state: worker.state,
        });
    }

    async fn fetch_through(&self, request: Request) -> std::result::Result<Response, NetError> {
        match self.handle_fetch(request).await {
            Ok(FetchOutcome::Respond(response)) => Ok(response),
            Ok(FetchOutcome::Passthrough(request)) => self.fetcher.fetch(request).await,
            Err(ServiceWorkerError::Network(e)) => Err(e),
            Err(e) => Err(NetError::RequestFailed(e.to_string())),
        }
    }
}

/// Page-side fetch: through the active worker, or straight to the network.
impl Fetcher for ServiceWorkerContainer {
    fn fetch(&self, request: Request) -> BoxFuture<'_, std::result::Result<Response, NetError>> {
        Box::pin(self.fetch_through(request))
    }
}
