//! Update coordinator.
//!
//! Looks for a waiting worker on mount (after a settle delay), whenever the
//! page becomes visible and on a long backstop interval. A waiting worker
//! moves the page to [`VersionState::WaitingForActivation`] and shows a
//! persistent prompt; accepting it posts `SKIP_WAITING`, and the controller
//! change that follows reloads the page once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use novira_common::NoviraError;
use novira_core::{UpdaterConfig, VersionState, WorkerMessage};
use novira_sw::{ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Update flow errors.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Worker error: {0}")]
    Worker(#[from] ServiceWorkerError),

    #[error("No waiting worker to activate")]
    NoWaitingWorker,
}

impl From<UpdateError> for NoviraError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::Worker(e) => e.into(),
            other => NoviraError::update_with_source("update flow failed", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// The notification offered when a new version is waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePrompt {
    pub title: String,
    pub description: String,
    pub action_label: String,
    /// Never auto-dismissed.
    pub persistent: bool,
}

impl Default for UpdatePrompt {
    fn default() -> Self {
        Self {
            title: "New Version Available".to_string(),
            description: "Refresh to see the latest updates and features.".to_string(),
            action_label: "Update Now".to_string(),
            persistent: true,
        }
    }
}

/// The page's view of its worker registration.
pub trait RegistrationHandle: Send + Sync {
    /// Whether a worker controls this page.
    fn has_controller(&self) -> BoxFuture<'_, bool>;

    /// Ask the registration to look for a newer version.
    fn update(&self) -> BoxFuture<'_, Result<()>>;

    fn has_waiting(&self) -> BoxFuture<'_, bool>;

    /// Post `SKIP_WAITING` to the waiting worker.
    fn skip_waiting(&self) -> BoxFuture<'_, Result<()>>;
}

/// What the coordinator can do to the page.
pub trait PageHandle: Send + Sync {
    fn show_update_prompt(&self, prompt: &UpdatePrompt);
    fn reload(&self);
}

/// [`RegistrationHandle`] backed by an in-process container.
pub struct ContainerHandle {
    container: Arc<ServiceWorkerContainer>,
    client_id: String,
}

impl ContainerHandle {
    pub fn new(container: Arc<ServiceWorkerContainer>, client_id: impl Into<String>) -> Self {
        Self {
            container,
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl RegistrationHandle for ContainerHandle {
    fn has_controller(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.container.controller_of(&self.client_id).await.is_some() })
    }

    fn update(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.container.update().await?;
            Ok(())
        })
    }

    fn has_waiting(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.container.waiting().await.is_some() })
    }

    fn skip_waiting(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let waiting = self
                .container
                .waiting()
                .await
                .ok_or(UpdateError::NoWaitingWorker)?;
            self.container
                .post_message(waiting, &WorkerMessage::SkipWaiting.encode())
                .await?;
            Ok(())
        })
    }
}

/// Inputs to [`UpdateCoordinator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    VisibilityChanged(bool),
    /// A new worker reached the installed state.
    WorkerInstalled,
    ControllerChange,
    /// The user pressed the prompt's action.
    UpdateAccepted,
    Unmount,
}

impl PageEvent {
    /// What a container event means to the page `client_id`.
    pub fn from_worker_event(event: &ServiceWorkerEvent, client_id: &str) -> Option<Self> {
        match event {
            ServiceWorkerEvent::StateChange {
                new_state: ServiceWorkerState::Installed,
                ..
            } => Some(Self::WorkerInstalled),
            ServiceWorkerEvent::ControllerChange { client_id: id, .. } if id == client_id => {
                Some(Self::ControllerChange)
            }
            _ => None,
        }
    }
}

/// Forward container events relevant to `client_id` into a page event queue.
pub fn forward_worker_events(
    mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    page: mpsc::UnboundedSender<PageEvent>,
    client_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(event) = PageEvent::from_worker_event(&event, &client_id) {
                if page.send(event).is_err() {
                    break;
                }
            }
        }
    })
}

/// Drives the waiting-worker handoff for one page.
pub struct UpdateCoordinator {
    config: UpdaterConfig,
    registration: Arc<dyn RegistrationHandle>,
    page: Arc<dyn PageHandle>,
    prompt: UpdatePrompt,
    state: Mutex<VersionState>,
    /// One-shot reload guard.
    reloading: AtomicBool,
}

impl UpdateCoordinator {
    pub fn new(
        config: UpdaterConfig,
        registration: Arc<dyn RegistrationHandle>,
        page: Arc<dyn PageHandle>,
    ) -> Self {
        Self {
            config,
            registration,
            page,
            prompt: UpdatePrompt::default(),
            state: Mutex::new(VersionState::NoWorker),
            reloading: AtomicBool::new(false),
        }
    }

    pub fn with_prompt(mut self, prompt: UpdatePrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn state(&self) -> VersionState {
        *self.lock_state()
    }

    /// Whether the page reload has been triggered.
    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, VersionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: VersionState) -> VersionState {
        std::mem::replace(&mut *self.lock_state(), next)
    }

    /// Ask the registration for a new version, then look for a waiting
    /// worker. Update failures are logged and left for the next check.
    pub async fn check_for_update(&self) -> VersionState {
        if !self.registration.has_controller().await {
            debug!("Page not controlled, skipping update check");
            return self.state();
        }

        {
            let mut state = self.lock_state();
            if *state == VersionState::NoWorker {
                *state = VersionState::ActiveOnly;
            }
        }

        debug!("Checking for worker update");
        if let Err(e) = self.registration.update().await {
            let err = NoviraError::from(e);
            if err.is_retryable() {
                warn!(
                    error = %err,
                    category = err.category(),
                    "Worker update check failed, retrying on next check"
                );
            } else {
                error!(
                    error = %err,
                    category = err.category(),
                    "Worker update check failed"
                );
            }
        }

        self.refresh_waiting().await
    }

    /// Re-read the waiting slot and prompt if a worker is there.
    pub async fn refresh_waiting(&self) -> VersionState {
        if !self.registration.has_controller().await {
            return self.state();
        }

        if self.registration.has_waiting().await {
            self.on_waiting_worker();
        } else {
            let mut state = self.lock_state();
            if *state == VersionState::WaitingForActivation {
                *state = VersionState::ActiveOnly;
            }
        }
        self.state()
    }

    /// A worker is waiting. Prompts once per entry into the waiting state.
    pub fn on_waiting_worker(&self) {
        let previous = {
            let mut state = self.lock_state();
            match *state {
                VersionState::WaitingForActivation | VersionState::Activating => return,
                previous => {
                    *state = VersionState::WaitingForActivation;
                    previous
                }
            }
        };

        info!(?previous, "New worker waiting, prompting for update");
        self.page.show_update_prompt(&self.prompt);
    }

    /// Tell the waiting worker to take over.
    pub async fn accept_update(&self) -> Result<()> {
        let previous = self.set_state(VersionState::Activating);
        info!("Update accepted, sending skip waiting");

        if let Err(e) = self.registration.skip_waiting().await {
            warn!(error = %e, "Skip waiting failed");
            self.set_state(previous);
            return Err(e);
        }
        Ok(())
    }

    /// The page got a new controller. Reloads at most once, and only when
    /// a newer version was pending.
    pub fn on_controller_change(&self) -> bool {
        if !self.state().has_pending_update() {
            debug!("Controller changed with no pending update");
            return false;
        }
        if self.reloading.swap(true, Ordering::SeqCst) {
            debug!("Reload already triggered");
            return false;
        }

        info!("New worker in control, reloading page");
        self.page.reload();
        true
    }

    pub async fn on_visibility_change(&self, visible: bool) -> Option<VersionState> {
        if visible {
            Some(self.check_for_update().await)
        } else {
            None
        }
    }

    pub async fn handle_event(&self, event: PageEvent) {
        match event {
            PageEvent::VisibilityChanged(visible) => {
                self.on_visibility_change(visible).await;
            }
            PageEvent::WorkerInstalled => {
                self.refresh_waiting().await;
            }
            PageEvent::ControllerChange => {
                self.on_controller_change();
            }
            PageEvent::UpdateAccepted => {
                // Failure is logged and the prompt stays up.
                let _ = self.accept_update().await;
            }
            PageEvent::Unmount => {}
        }
    }

    /// Run the check schedule until [`PageEvent::Unmount`] or the sender
    /// is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PageEvent>) {
        let settle = tokio::time::sleep(self.config.settle_delay());
        tokio::pin!(settle);
        let mut settled = false;

        let period = self.config.check_interval();
        let mut backstop = interval_at(Instant::now() + period, period);
        backstop.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            settle_ms = self.config.settle_delay_ms,
            interval_ms = self.config.check_interval_ms,
            "Update coordinator started"
        );

        loop {
            tokio::select! {
                _ = &mut settle, if !settled => {
                    settled = true;
                    self.check_for_update().await;
                }
                _ = backstop.tick() => {
                    self.check_for_update().await;
                }
                event = events.recv() => match event {
                    Some(PageEvent::Unmount) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
            }
        }

        debug!("Update coordinator stopped");
    }
}
