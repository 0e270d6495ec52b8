use crate::client::EventTransport;
use crate::collector::{BatchHandler, EventCollector};
use crate::events::TrackingEvent;
use crate::platform::WindowInfo;
use crate::queue::EventQueue;
use crate::tracker::{
    ActivityState, ActivityTracker, StateChangeCallback, WindowChangeCallback, WindowTracker,
};
use crate::url::parser::{is_browser_application, url_from_title};
use crate::url::UrlStore;
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::Result;
use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_DRAIN_BATCH: usize = 100;
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const QUEUE_CLEANUP_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Internal health surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub current_state: ActivityState,
    pub pending_events: i64,
    pub collector_pending: usize,
}

struct Synthesis {
    current_window: Option<WindowInfo>,
    current_state: ActivityState,
    last_event_time: Option<Instant>,
    last_timestamp: i64,
}

struct Inner {
    window_tracker: WindowTracker,
    activity_tracker: ActivityTracker,
    collector: EventCollector,
    transport: Arc<dyn EventTransport>,
    queue: EventQueue,
    url_store: Option<Arc<UrlStore>>,
    device_id: String,
    synthesis: Mutex<Synthesis>,
    stopped: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    drain_worker: Mutex<Option<WorkerHandle>>,
}

/// Wires trackers, collector, transport, and the durable queue together, and
/// owns the shutdown ordering.
#[derive(Clone)]
pub struct TrackingService {
    inner: Arc<Inner>,
}

impl TrackingService {
    pub fn new(
        window_tracker: WindowTracker,
        activity_tracker: ActivityTracker,
        collector: EventCollector,
        transport: Arc<dyn EventTransport>,
        queue: EventQueue,
        url_store: Option<Arc<UrlStore>>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                window_tracker,
                activity_tracker,
                collector,
                transport,
                queue,
                url_store,
                device_id: device_id.into(),
                synthesis: Mutex::new(Synthesis {
                    current_window: None,
                    current_state: ActivityState::Active,
                    last_event_time: None,
                    last_timestamp: 0,
                }),
                stopped: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
                drain_worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        info!("Starting tracking service: device_id={}", self.inner.device_id);

        self.inner.window_tracker.start(Arc::new(self.clone()))?;

        if let Err(e) = self.inner.activity_tracker.start(Arc::new(self.clone())) {
            self.inner.window_tracker.stop();
            return Err(e);
        }

        self.inner.collector.start(Arc::new(self.clone()))?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *self
            .inner
            .stop_tx
            .lock()
            .expect("service stop lock poisoned") = Some(stop_tx);

        let service = self.clone();
        let drain_worker = spawn_worker("queue-drain", move || {
            let ticker = tick(QUEUE_DRAIN_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => service.process_queue(),
                    recv(stop_rx) -> _ => {
                        // One last drain attempt before the process goes away.
                        service.process_queue();
                        return;
                    }
                }
            }
        })?;
        *self
            .inner
            .drain_worker
            .lock()
            .expect("service drain lock poisoned") = Some(drain_worker);

        info!("Tracking service started");
        Ok(())
    }

    /// Shutdown with a hard ordering: hooks come off first, the collector
    /// drains last. Safe to call repeatedly and from callbacks.
    pub fn stop(&self) {
        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .expect("service stop lock poisoned")
            .take();
        if stop_tx.is_none() {
            return;
        }
        info!("Stopping tracking service");
        self.inner.stopped.store(true, Ordering::SeqCst);

        // Uninstalls the OS hooks; required for process exit.
        self.inner.activity_tracker.stop();
        self.inner.window_tracker.stop();

        // Flushes residue through on_batch_ready exactly once.
        self.inner.collector.stop();

        drop(stop_tx);
        if let Some(worker) = self
            .inner
            .drain_worker
            .lock()
            .expect("service drain lock poisoned")
            .take()
        {
            if !worker.join_timeout(WORKER_STOP_TIMEOUT) {
                warn!("Queue drain worker did not stop within {WORKER_STOP_TIMEOUT:?}");
            }
        }

        // Best-effort; the collector is already drained unless a callback
        // raced the shutdown.
        self.inner.collector.flush();

        // Opportunistic poison-event cleanup; not worth blocking exit on.
        let queue = self.inner.queue.clone();
        let _ = std::thread::Builder::new()
            .name("queue-cleanup".into())
            .spawn(move || {
                if let Err(e) = queue.cleanup(QUEUE_CLEANUP_WINDOW) {
                    error!("Failed to cleanup old events: {e}");
                }
            });

        info!("Tracking service stopped");
    }

    pub fn status(&self) -> StatusSnapshot {
        let current_state = self
            .inner
            .synthesis
            .lock()
            .expect("synthesis lock poisoned")
            .current_state;
        StatusSnapshot {
            device_id: self.inner.device_id.clone(),
            current_state,
            pending_events: self
                .inner
                .queue
                .pending_count(&self.inner.device_id)
                .unwrap_or(0),
            collector_pending: self.inner.collector.pending_count(),
        }
    }

    /// Build one event from the current window/state pair and hand it to the
    /// collector. Synthesis is serialised under one lock, which is what keeps
    /// per-device timestamps monotonic.
    fn create_event(&self, window: Option<&WindowInfo>, state: Option<ActivityState>) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let event = {
            let mut synthesis = self.inner.synthesis.lock().expect("synthesis lock poisoned");

            let status = state.unwrap_or(synthesis.current_state);
            let window = window.or(synthesis.current_window.as_ref());

            let now = Instant::now();
            let timestamp = Utc::now()
                .timestamp_millis()
                .max(synthesis.last_timestamp);
            let duration = synthesis
                .last_event_time
                .map(|last| now.duration_since(last).as_millis() as i64)
                .filter(|ms| *ms > 0);

            let mut event = TrackingEvent {
                device_id: self.inner.device_id.clone(),
                timestamp,
                status,
                application: None,
                title: None,
                url: None,
                duration,
                project_id: None,
            };

            if let Some(window) = window {
                if !window.application.is_empty() {
                    event.application = Some(window.application.to_lowercase());
                }
                if !window.title.is_empty() {
                    event.title = Some(window.title.clone());
                }
                event.url = self.resolve_url(window);
            }

            synthesis.last_event_time = Some(now);
            synthesis.last_timestamp = timestamp;
            event
        };

        self.inner.collector.add(event);
    }

    /// Extension-provided URL first, title heuristics second, absent
    /// otherwise; browsers only.
    fn resolve_url(&self, window: &WindowInfo) -> Option<String> {
        if window.application.is_empty() || !is_browser_application(&window.application) {
            return None;
        }
        if let Some(store) = &self.inner.url_store {
            if let Some(url) = store.lookup(&window.application, &window.title) {
                debug!(
                    "Using extension-provided URL: url={url} application={} title={}",
                    window.application, window.title
                );
                return Some(url);
            }
        }
        url_from_title(&window.title, &window.application)
    }

    pub(crate) fn process_queue(&self) {
        let pending = match self.inner.queue.pending_count(&self.inner.device_id) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to get pending count: {e}");
                return;
            }
        };
        if pending == 0 {
            return;
        }
        debug!("Processing queued events: pending_count={pending}");

        let (events, ids) = match self.inner.queue.dequeue(&self.inner.device_id, QUEUE_DRAIN_BATCH)
        {
            Ok(dequeued) => dequeued,
            Err(e) => {
                error!("Failed to dequeue events: {e}");
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        match self
            .inner
            .transport
            .send_batch(&self.inner.device_id, &events)
        {
            Ok(()) => {
                if let Err(e) = self.inner.queue.remove(&ids) {
                    error!("Failed to remove sent events from queue: {e}");
                } else {
                    info!("Successfully sent queued events: event_count={}", events.len());
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(
                        "Failed to send queued batch, will retry: event_count={} error={e}",
                        events.len()
                    );
                } else {
                    warn!(
                        "Failed to send queued batch, operator action needed: event_count={} error={e}",
                        events.len()
                    );
                }
                if let Err(e) = self.inner.queue.increment_retry(&ids) {
                    error!("Failed to increment retry count: {e}");
                }
            }
        }
    }
}

impl WindowChangeCallback for TrackingService {
    fn on_window_change(&self, window: WindowInfo) {
        {
            let mut synthesis = self.inner.synthesis.lock().expect("synthesis lock poisoned");
            synthesis.current_window = Some(window.clone());
        }

        // A window switch is user presence even without input events.
        self.inner.activity_tracker.record_activity();

        self.create_event(Some(&window), None);
    }
}

impl StateChangeCallback for TrackingService {
    fn on_state_change(&self, state: ActivityState) {
        let old_state = {
            let mut synthesis = self.inner.synthesis.lock().expect("synthesis lock poisoned");
            let old = synthesis.current_state;
            synthesis.current_state = state;
            old
        };
        if old_state != state {
            self.create_event(None, Some(state));
        }
    }
}

impl BatchHandler for TrackingService {
    fn on_batch_ready(&self, events: Vec<TrackingEvent>) {
        if events.is_empty() {
            return;
        }
        debug!("Batch ready to send: event_count={}", events.len());

        if let Err(e) = self
            .inner
            .transport
            .send_batch(&self.inner.device_id, &events)
        {
            warn!(
                "Failed to send batch, queuing locally: event_count={} error={e}",
                events.len()
            );
            if let Err(queue_err) = self.inner.queue.enqueue(&self.inner.device_id, &events) {
                error!("Failed to queue events, batch dropped: {queue_err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SendError;
    use crate::database::Database;
    use crate::platform::{ActivitySink, Platform, SystemInfo};
    use tempfile::tempdir;

    fn backend_unavailable() -> SendError {
        SendError::Backend {
            message: "backend returned status 503".into(),
        }
    }

    struct NullPlatform;

    impl Platform for NullPlatform {
        fn active_window(&self) -> Result<WindowInfo> {
            anyhow::bail!("no window")
        }
        fn start_input_monitoring(&self, _sink: ActivitySink) -> Result<()> {
            Ok(())
        }
        fn stop_input_monitoring(&self) {}
        fn device_identity(&self) -> Result<String> {
            Ok("test-device".into())
        }
        fn system_info(&self) -> Result<SystemInfo> {
            anyhow::bail!("unused")
        }
        fn open_browser(&self, _url: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Transport whose availability tests toggle; records delivered batches.
    struct FlakyTransport {
        available: AtomicBool,
        delivered: Mutex<Vec<Vec<TrackingEvent>>>,
    }

    impl FlakyTransport {
        fn new(available: bool) -> Arc<Self> {
            Arc::new(Self {
                available: AtomicBool::new(available),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn delivered_events(&self) -> Vec<TrackingEvent> {
            self.delivered.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    impl EventTransport for FlakyTransport {
        fn send_batch(&self, _device_id: &str, events: &[TrackingEvent]) -> Result<(), SendError> {
            if self.available.load(Ordering::SeqCst) {
                self.delivered.lock().unwrap().push(events.to_vec());
                Ok(())
            } else {
                Err(backend_unavailable())
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        transport: Arc<FlakyTransport>,
        queue: EventQueue,
        service: TrackingService,
    }

    fn fixture(batch_size: usize, transport_up: bool, url_store: Option<Arc<UrlStore>>) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("agent.db")).expect("open db");
        let queue = EventQueue::new(&db);
        let transport = FlakyTransport::new(transport_up);
        let platform: Arc<dyn Platform> = Arc::new(NullPlatform);

        let service = TrackingService::new(
            WindowTracker::new(Arc::clone(&platform), Duration::from_secs(3600)),
            ActivityTracker::new(
                Arc::clone(&platform),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ),
            EventCollector::new(batch_size, Duration::from_secs(3600)),
            transport.clone(),
            queue.clone(),
            url_store,
            "dev-1",
        );
        Fixture {
            _dir: dir,
            transport,
            queue,
            service,
        }
    }

    fn window(title: &str, application: &str) -> WindowInfo {
        WindowInfo {
            title: title.into(),
            application: application.into(),
            process_id: 42,
            process_path: String::new(),
            is_visible: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn synthesises_monotonic_events_with_duration() {
        let f = fixture(100, true, None);
        f.service.start().expect("start");
        f.service.on_window_change(window("Editor", "Code"));
        std::thread::sleep(Duration::from_millis(10));
        f.service.on_window_change(window("Terminal", "WezTerm"));
        f.service.inner.collector.flush();
        let events = f.transport.delivered_events();
        f.service.stop();
        assert_eq!(events.len(), 2);
        assert!(events[1].timestamp >= events[0].timestamp);
        assert_eq!(events[0].duration, None);
        assert!(events[1].duration.unwrap() > 0);
        assert_eq!(events[0].application.as_deref(), Some("code"));
        assert_eq!(events[0].status, ActivityState::Active);
    }

    #[test]
    fn state_change_emits_single_event() {
        let f = fixture(100, true, None);
        f.service.start().expect("start");
        f.service.on_window_change(window("Editor", "Code"));
        f.service.on_state_change(ActivityState::Idle);
        f.service.on_state_change(ActivityState::Idle);
        f.service.inner.collector.flush();
        let events = f.transport.delivered_events();
        f.service.stop();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, ActivityState::Idle);
        // State events inherit the current window.
        assert_eq!(events[1].application.as_deref(), Some("code"));
    }

    #[test]
    fn url_precedence_prefers_extension_over_title_parse() {
        let store = Arc::new(UrlStore::new(Duration::from_secs(60)).expect("store"));
        store.store("Google Chrome", "GitHub · Repos", "https://github.com/x");
        let f = fixture(100, true, Some(store.clone()));
        f.service.start().expect("start");

        f.service.on_window_change(window("GitHub · Repos", "chrome"));
        f.service.on_window_change(window("YouTube - Google Chrome", "chrome"));
        f.service.on_window_change(window("Notes", "notepad"));
        f.service.inner.collector.flush();
        let events = f.transport.delivered_events();
        f.service.stop();

        assert_eq!(events[0].url.as_deref(), Some("https://github.com/x"));
        assert_eq!(events[1].url.as_deref(), Some("https://youtube.com"));
        assert_eq!(events[2].url, None);
        store.stop();
    }

    #[test]
    fn failed_batches_land_in_queue_and_drain_later() {
        let f = fixture(2, false, None);
        f.service.start().expect("start");
        f.service.on_window_change(window("One", "app"));
        f.service.on_window_change(window("Two", "app"));

        // Batch of two hit the dead transport and was persisted.
        assert_eq!(f.queue.pending_count("dev-1").expect("count"), 2);
        assert!(f.transport.delivered_events().is_empty());

        f.transport.available.store(true, Ordering::SeqCst);
        f.service.process_queue();
        assert_eq!(f.queue.pending_count("dev-1").expect("count"), 0);
        assert_eq!(f.transport.delivered_events().len(), 2);
        f.service.stop();
    }

    #[test]
    fn failed_drain_increments_retry() {
        let f = fixture(1, false, None);
        f.service.start().expect("start");
        f.service.on_window_change(window("One", "app"));
        assert_eq!(f.queue.pending_count("dev-1").expect("count"), 1);

        f.service.process_queue();
        let (_, ids) = f.queue.dequeue("dev-1", 10).expect("dequeue");
        assert_eq!(ids.len(), 1);
        assert_eq!(f.queue.pending_count("dev-1").expect("count"), 1);
        f.service.stop();
    }

    #[test]
    fn stopped_service_synthesises_nothing() {
        let f = fixture(100, true, None);
        f.service.start().expect("start");
        f.service.stop();
        f.service.on_window_change(window("Editor", "Code"));
        f.service.inner.collector.flush();
        assert!(f.transport.delivered_events().is_empty());
    }

    #[test]
    fn stop_twice_is_harmless() {
        let f = fixture(100, true, None);
        f.service.start().expect("start");
        f.service.stop();
        f.service.stop();
    }

    #[test]
    fn status_reports_pending_counts() {
        let f = fixture(100, false, None);
        f.service.start().expect("start");
        f.service.on_window_change(window("Editor", "Code"));
        let status = f.service.status();
        assert_eq!(status.device_id, "dev-1");
        assert_eq!(status.current_state, ActivityState::Active);
        assert_eq!(status.collector_pending, 1);
        assert_eq!(status.pending_events, 0);
        f.service.stop();
    }
}
