use crate::platform::{Platform, WindowInfo};
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, warn};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub trait WindowChangeCallback: Send + Sync {
    fn on_window_change(&self, window: WindowInfo);
}

struct Inner {
    platform: Arc<dyn Platform>,
    poll_interval: Duration,
    current: RwLock<Option<WindowInfo>>,
    callback: RwLock<Option<Arc<dyn WindowChangeCallback>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Polls the probe for the foreground window and reports diffs. The first
/// observation always counts as a change.
#[derive(Clone)]
pub struct WindowTracker {
    inner: Arc<Inner>,
}

impl WindowTracker {
    pub fn new(platform: Arc<dyn Platform>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                poll_interval,
                current: RwLock::new(None),
                callback: RwLock::new(None),
                stop_tx: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self, callback: Arc<dyn WindowChangeCallback>) -> Result<()> {
        *self
            .inner
            .callback
            .write()
            .expect("window callback lock poisoned") = Some(callback);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *self
            .inner
            .stop_tx
            .lock()
            .expect("window stop lock poisoned") = Some(stop_tx);

        let tracker = self.clone();
        let poll_interval = self.inner.poll_interval;
        let worker = spawn_worker("window-poll", move || {
            // Sample immediately so the first event does not wait a full tick.
            tracker.check_window();
            let ticker = tick(poll_interval);
            loop {
                select! {
                    recv(ticker) -> _ => tracker.check_window(),
                    recv(stop_rx) -> _ => return,
                }
            }
        })?;
        *self
            .inner
            .worker
            .lock()
            .expect("window worker lock poisoned") = Some(worker);

        debug!("Window tracker started (poll_interval={:?})", poll_interval);
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&self) {
        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .expect("window stop lock poisoned")
            .take();
        if stop_tx.is_none() {
            return;
        }
        drop(stop_tx);

        if let Some(worker) = self
            .inner
            .worker
            .lock()
            .expect("window worker lock poisoned")
            .take()
        {
            if !worker.join_timeout(STOP_TIMEOUT) {
                warn!("Window poll worker did not stop within {STOP_TIMEOUT:?}");
            }
        }
        debug!("Window tracker stopped");
    }

    pub fn current_window(&self) -> Option<WindowInfo> {
        self.inner
            .current
            .read()
            .expect("window current lock poisoned")
            .clone()
    }

    fn check_window(&self) {
        let window = match self.inner.platform.active_window() {
            Ok(window) => window,
            Err(e) => {
                warn!("Failed to get active window: {e}");
                return;
            }
        };

        let changed = {
            let mut current = self
                .inner
                .current
                .write()
                .expect("window current lock poisoned");
            if has_changed(current.as_ref(), &window) {
                *current = Some(window.clone());
                true
            } else {
                false
            }
        };

        if changed {
            debug!(
                "Window changed: application={} title={}",
                window.application, window.title
            );
            // Invoked after the guard is released; the callback feeds the
            // orchestrator, which reads back into this tracker.
            let callback = self
                .inner
                .callback
                .read()
                .expect("window callback lock poisoned")
                .clone();
            if let Some(callback) = callback {
                callback.on_window_change(window);
            }
        }
    }
}

fn has_changed(current: Option<&WindowInfo>, new: &WindowInfo) -> bool {
    match current {
        None => true,
        Some(current) => {
            current.process_id != new.process_id
                || current.title != new.title
                || current.application != new.application
                || current.is_visible != new.is_visible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ActivitySink, SystemInfo};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn window(title: &str, application: &str, pid: u32) -> WindowInfo {
        WindowInfo {
            title: title.into(),
            application: application.into(),
            process_id: pid,
            process_path: String::new(),
            is_visible: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn first_observation_is_a_change() {
        assert!(has_changed(None, &window("a", "app", 1)));
    }

    #[test]
    fn detects_diffs_per_field() {
        let base = window("a", "app", 1);
        assert!(!has_changed(Some(&base), &window("a", "app", 1)));
        assert!(has_changed(Some(&base), &window("b", "app", 1)));
        assert!(has_changed(Some(&base), &window("a", "other", 1)));
        assert!(has_changed(Some(&base), &window("a", "app", 2)));

        let mut hidden = window("a", "app", 1);
        hidden.is_visible = false;
        assert!(has_changed(Some(&base), &hidden));
    }

    #[test]
    fn timestamp_alone_is_not_a_change() {
        let base = window("a", "app", 1);
        let mut later = base.clone();
        later.timestamp = Utc::now();
        assert!(!has_changed(Some(&base), &later));
    }

    struct ScriptedPlatform {
        polls: AtomicUsize,
        windows: Vec<WindowInfo>,
    }

    impl Platform for ScriptedPlatform {
        fn active_window(&self) -> Result<WindowInfo> {
            let i = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.windows[i.min(self.windows.len() - 1)].clone())
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

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl WindowChangeCallback for Recorder {
        fn on_window_change(&self, window: WindowInfo) {
            self.seen.lock().unwrap().push(window.title);
        }
    }

    #[test]
    fn polls_immediately_and_reports_only_diffs() {
        let platform = Arc::new(ScriptedPlatform {
            polls: AtomicUsize::new(0),
            windows: vec![
                window("editor", "code", 10),
                window("editor", "code", 10),
                window("inbox", "thunderbird", 20),
            ],
        });
        let tracker = WindowTracker::new(platform, Duration::from_millis(20));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        tracker.start(recorder.clone()).expect("start");

        // First poll happens before the first tick; then two more ticks.
        std::thread::sleep(Duration::from_millis(70));
        tracker.stop();

        let seen = recorder.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert_eq!(seen[0], "editor");
        assert!(seen.contains(&"inbox".to_string()));
        assert_eq!(seen.iter().filter(|t| *t == "editor").count(), 1);
        assert_eq!(tracker.current_window().unwrap().title, "inbox");
    }

    #[test]
    fn stop_twice_is_harmless() {
        let platform = Arc::new(ScriptedPlatform {
            polls: AtomicUsize::new(0),
            windows: vec![window("a", "app", 1)],
        });
        let tracker = WindowTracker::new(platform, Duration::from_millis(50));
        tracker
            .start(Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
            }))
            .expect("start");
        tracker.stop();
        tracker.stop();
    }
}
