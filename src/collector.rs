use crate::events::TrackingEvent;
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub trait BatchHandler: Send + Sync {
    fn on_batch_ready(&self, events: Vec<TrackingEvent>);
}

struct Inner {
    batch_size: usize,
    flush_interval: Duration,
    events: Mutex<Vec<TrackingEvent>>,
    handler: RwLock<Option<Arc<dyn BatchHandler>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Accumulates tracking events and hands them to the registered handler in
/// batches, by size or by time. Every event added before `stop()` returns is
/// delivered exactly once.
#[derive(Clone)]
pub struct EventCollector {
    inner: Arc<Inner>,
}

impl EventCollector {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                batch_size,
                flush_interval,
                events: Mutex::new(Vec::new()),
                handler: RwLock::new(None),
                stop_tx: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self, handler: Arc<dyn BatchHandler>) -> Result<()> {
        *self
            .inner
            .handler
            .write()
            .expect("collector handler lock poisoned") = Some(handler);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *self
            .inner
            .stop_tx
            .lock()
            .expect("collector stop lock poisoned") = Some(stop_tx);

        let collector = self.clone();
        let flush_interval = self.inner.flush_interval;
        let worker = spawn_worker("collector-flush", move || {
            let ticker = tick(flush_interval);
            loop {
                select! {
                    recv(ticker) -> _ => collector.flush(),
                    recv(stop_rx) -> _ => return,
                }
            }
        })?;
        *self
            .inner
            .worker
            .lock()
            .expect("collector worker lock poisoned") = Some(worker);

        info!(
            "Event collector started (batch_size={}, flush_interval={:?})",
            self.inner.batch_size, flush_interval
        );
        Ok(())
    }

    pub fn add(&self, event: TrackingEvent) {
        let batch = {
            let mut events = self
                .inner
                .events
                .lock()
                .expect("collector events lock poisoned");
            events.push(event);
            if events.len() >= self.inner.batch_size {
                Some(std::mem::take(&mut *events))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            debug!("Batch size reached, flushing {} events", batch.len());
            self.dispatch(batch);
        }
    }

    /// Drain whatever is buffered through the handler.
    pub fn flush(&self) {
        let batch = {
            let mut events = self
                .inner
                .events
                .lock()
                .expect("collector events lock poisoned");
            if events.is_empty() {
                return;
            }
            std::mem::take(&mut *events)
        };
        debug!("Flushing {} events", batch.len());
        self.dispatch(batch);
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .events
            .lock()
            .expect("collector events lock poisoned")
            .len()
    }

    /// Stops the auto-flush worker and drains any residue through the
    /// handler exactly once. Idempotent.
    pub fn stop(&self) {
        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .expect("collector stop lock poisoned")
            .take();
        if stop_tx.is_none() {
            return;
        }
        drop(stop_tx);

        if let Some(worker) = self
            .inner
            .worker
            .lock()
            .expect("collector worker lock poisoned")
            .take()
        {
            if !worker.join_timeout(STOP_TIMEOUT) {
                warn!("Collector flush worker did not stop within {STOP_TIMEOUT:?}");
            }
        }

        self.flush();
        info!("Event collector stopped");
    }

    fn dispatch(&self, batch: Vec<TrackingEvent>) {
        // The handler runs outside the buffer lock; it may block on I/O.
        let handler = self
            .inner
            .handler
            .read()
            .expect("collector handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            handler.on_batch_ready(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ActivityState;

    fn event(n: i64) -> TrackingEvent {
        TrackingEvent {
            device_id: "dev-1".into(),
            timestamp: n,
            status: ActivityState::Active,
            application: None,
            title: None,
            url: None,
            duration: None,
            project_id: None,
        }
    }

    struct CapturingHandler {
        batches: Mutex<Vec<Vec<TrackingEvent>>>,
    }

    impl CapturingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
            })
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }

        fn total_events(&self) -> usize {
            self.batches.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    impl BatchHandler for CapturingHandler {
        fn on_batch_ready(&self, events: Vec<TrackingEvent>) {
            self.batches.lock().unwrap().push(events);
        }
    }

    #[test]
    fn does_not_flush_below_batch_size() {
        let collector = EventCollector::new(3, Duration::from_secs(3600));
        let handler = CapturingHandler::new();
        collector.start(handler.clone()).expect("start");

        collector.add(event(1));
        collector.add(event(2));
        assert!(handler.batches.lock().unwrap().is_empty());
        assert_eq!(collector.pending_count(), 2);
        collector.stop();
    }

    #[test]
    fn flushes_exactly_at_batch_size() {
        let collector = EventCollector::new(3, Duration::from_secs(3600));
        let handler = CapturingHandler::new();
        collector.start(handler.clone()).expect("start");

        for n in 0..3 {
            collector.add(event(n));
        }
        assert_eq!(handler.batch_sizes(), vec![3]);
        assert_eq!(collector.pending_count(), 0);
        collector.stop();
    }

    #[test]
    fn manual_flush_drains_buffer() {
        let collector = EventCollector::new(100, Duration::from_secs(3600));
        let handler = CapturingHandler::new();
        collector.start(handler.clone()).expect("start");

        collector.add(event(1));
        collector.flush();
        collector.flush(); // empty buffer is a no-op
        assert_eq!(handler.batch_sizes(), vec![1]);
        collector.stop();
    }

    #[test]
    fn ticker_flushes_periodically() {
        let collector = EventCollector::new(100, Duration::from_millis(20));
        let handler = CapturingHandler::new();
        collector.start(handler.clone()).expect("start");

        collector.add(event(1));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(handler.total_events(), 1);
        collector.stop();
    }

    #[test]
    fn stop_delivers_residue_exactly_once() {
        let collector = EventCollector::new(100, Duration::from_secs(3600));
        let handler = CapturingHandler::new();
        collector.start(handler.clone()).expect("start");

        for n in 0..5 {
            collector.add(event(n));
        }
        collector.stop();
        collector.stop();
        assert_eq!(handler.total_events(), 5);
        assert_eq!(collector.pending_count(), 0);
    }
}
