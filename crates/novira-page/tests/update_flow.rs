//! Update handoff against a real container.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use novira_core::{NoviraConfig, VersionState};
use novira_net::MockFetcher;
use novira_page::{
    forward_worker_events, ContainerHandle, PageEvent, PageHandle, UpdateCoordinator, UpdatePrompt,
};
use novira_sw::{ServiceWorkerContainer, ServiceWorkerEvent};
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "https://app.novira.test/";

#[derive(Default)]
struct RecordingPage {
    prompts: Mutex<Vec<UpdatePrompt>>,
    reloads: AtomicUsize,
}

impl RecordingPage {
    fn prompts(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl PageHandle for RecordingPage {
    fn show_update_prompt(&self, prompt: &UpdatePrompt) {
        self.prompts.lock().unwrap().push(prompt.clone());
    }

    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(version: &str) -> NoviraConfig {
    let mut config = NoviraConfig::default();
    config.worker.origin = ORIGIN.to_string();
    config.worker.version = version.to_string();
    config.worker.skip_waiting_on_install = false;
    config
}

struct Harness {
    container: Arc<ServiceWorkerContainer>,
    events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    client_id: String,
    coordinator: Arc<UpdateCoordinator>,
    page: Arc<RecordingPage>,
}

async fn harness() -> Harness {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher
        .respond(ORIGIN, 200, "<html>")
        .respond("https://app.novira.test/Novira.png", 200, "png")
        .respond("https://app.novira.test/manifest.json", 200, "{}");

    let v1 = config("v2.5.0");
    let (container, events) = ServiceWorkerContainer::new(&v1, fetcher).unwrap();
    let container = Arc::new(container);
    container.register(v1.worker.clone()).await.unwrap();

    let client_id = container.connect_client(Url::parse(ORIGIN).unwrap()).await;
    let page = Arc::new(RecordingPage::default());
    let coordinator = Arc::new(UpdateCoordinator::new(
        v1.updater.clone(),
        Arc::new(ContainerHandle::new(Arc::clone(&container), client_id.clone())),
        page.clone(),
    ));

    Harness {
        container,
        events,
        client_id,
        coordinator,
        page,
    }
}

#[tokio::test]
async fn waiting_worker_prompts_and_reloads_once() {
    let mut h = harness().await;
    assert_eq!(h.coordinator.check_for_update().await, VersionState::ActiveOnly);

    h.container.deploy(config("v2.6.0").worker).await;
    assert_eq!(
        h.coordinator.check_for_update().await,
        VersionState::WaitingForActivation
    );
    assert_eq!(h.page.prompts(), 1);
    while h.events.try_recv().is_ok() {}

    h.coordinator.accept_update().await.unwrap();
    assert_eq!(h.coordinator.state(), VersionState::Activating);

    let mut page_events = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        page_events.extend(PageEvent::from_worker_event(&event, &h.client_id));
    }
    assert!(page_events.contains(&PageEvent::ControllerChange));
    for event in page_events {
        h.coordinator.handle_event(event).await;
    }
    h.coordinator.on_controller_change();

    assert_eq!(h.page.reloads(), 1);
    assert_eq!(h.container.cache_names().await, vec!["novira-v2.6.0"]);
    let active = h.container.active().await.unwrap();
    assert_eq!(active.version(), "v2.6.0");
    assert_eq!(h.container.controller_of(&h.client_id).await, Some(active.id));
}

#[tokio::test]
async fn declined_prompt_stays_until_next_version() {
    let h = harness().await;
    h.container.deploy(config("v2.6.0").worker).await;

    h.coordinator.check_for_update().await;
    h.coordinator.check_for_update().await;
    h.coordinator
        .handle_event(PageEvent::VisibilityChanged(true))
        .await;

    assert_eq!(h.page.prompts(), 1);
    assert_eq!(h.page.reloads(), 0);
    assert_eq!(h.container.active().await.unwrap().version(), "v2.5.0");
}

#[tokio::test(start_paused = true)]
async fn scheduled_flow_through_event_queue() {
    let h = harness().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = forward_worker_events(h.events, tx.clone(), h.client_id.clone());
    let runner = tokio::spawn(Arc::clone(&h.coordinator).run(rx));

    h.container.deploy(config("v2.6.0").worker).await;

    // Mount check after the settle delay finds the new version.
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(h.page.prompts(), 1);
    assert_eq!(
        h.coordinator.state(),
        VersionState::WaitingForActivation
    );

    tx.send(PageEvent::UpdateAccepted).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.page.reloads(), 1);
    assert!(h.coordinator.is_reloading());

    tx.send(PageEvent::Unmount).unwrap();
    runner.await.unwrap();
    forwarder.abort();
}
