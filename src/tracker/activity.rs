use crate::platform::{ActivityEvent, ActivitySink, Platform};
use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const STATE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Coarse label the agent assigns to the user at a point in time. `Offline`
/// is reserved; no transition currently targets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Idle,
    Away,
    Offline,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Active => "active",
            ActivityState::Idle => "idle",
            ActivityState::Away => "away",
            ActivityState::Offline => "offline",
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait StateChangeCallback: Send + Sync {
    fn on_state_change(&self, state: ActivityState);
}

struct Shared {
    last_activity: Instant,
    current_state: ActivityState,
}

struct Inner {
    platform: Arc<dyn Platform>,
    idle_threshold: Duration,
    away_threshold: Duration,
    shared: RwLock<Shared>,
    callback: RwLock<Option<Arc<dyn StateChangeCallback>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Fuses input events, manual activity pulses, and a periodic check into the
/// active/idle/away state machine. Thresholds satisfy `away >= idle > 0`.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Inner>,
}

impl ActivityTracker {
    pub fn new(
        platform: Arc<dyn Platform>,
        idle_threshold: Duration,
        away_threshold: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                idle_threshold,
                away_threshold,
                shared: RwLock::new(Shared {
                    last_activity: Instant::now(),
                    current_state: ActivityState::Active,
                }),
                callback: RwLock::new(None),
                stop_tx: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self, callback: Arc<dyn StateChangeCallback>) -> Result<()> {
        *self
            .inner
            .callback
            .write()
            .expect("activity callback lock poisoned") = Some(callback);

        let sink_tracker = self.clone();
        let sink: ActivitySink = Arc::new(move |event| sink_tracker.handle_input(event));
        self.inner.platform.start_input_monitoring(sink)?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *self
            .inner
            .stop_tx
            .lock()
            .expect("activity stop lock poisoned") = Some(stop_tx);

        let tracker = self.clone();
        let worker = match spawn_worker("activity-check", move || {
            let ticker = tick(STATE_CHECK_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => tracker.check_state(),
                    recv(stop_rx) -> _ => return,
                }
            }
        }) {
            Ok(worker) => worker,
            Err(e) => {
                // Never leave hooks installed without their check worker.
                self.inner.platform.stop_input_monitoring();
                return Err(e);
            }
        };
        *self
            .inner
            .worker
            .lock()
            .expect("activity worker lock poisoned") = Some(worker);

        info!(
            "Activity tracker started (idle_threshold={:?}, away_threshold={:?})",
            self.inner.idle_threshold, self.inner.away_threshold
        );
        Ok(())
    }

    /// Idempotent. Joins the check worker, then uninstalls the OS hooks —
    /// hook removal must complete before the process can exit.
    pub fn stop(&self) {
        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .expect("activity stop lock poisoned")
            .take();
        if stop_tx.is_none() {
            return;
        }
        drop(stop_tx);

        if let Some(worker) = self
            .inner
            .worker
            .lock()
            .expect("activity worker lock poisoned")
            .take()
        {
            if !worker.join_timeout(STOP_TIMEOUT) {
                log::warn!("Activity check worker did not stop within {STOP_TIMEOUT:?}");
            }
        }
        self.inner.platform.stop_input_monitoring();
        info!("Activity tracker stopped");
    }

    pub fn current_state(&self) -> ActivityState {
        self.inner
            .shared
            .read()
            .expect("activity shared lock poisoned")
            .current_state
    }

    /// Manually record user presence, e.g. on a window change.
    pub fn record_activity(&self) {
        self.touch(Instant::now());
    }

    fn handle_input(&self, _event: ActivityEvent) {
        self.touch(Instant::now());
    }

    fn touch(&self, at: Instant) {
        let current = {
            let mut shared = self
                .inner
                .shared
                .write()
                .expect("activity shared lock poisoned");
            shared.last_activity = at;
            shared.current_state
        };
        if current != ActivityState::Active {
            self.set_state(ActivityState::Active);
        }
    }

    fn check_state(&self) {
        let (idle_for, current) = {
            let shared = self
                .inner
                .shared
                .read()
                .expect("activity shared lock poisoned");
            (shared.last_activity.elapsed(), shared.current_state)
        };

        let new_state = self.derive_state(idle_for);
        if new_state != current {
            self.set_state(new_state);
        }
    }

    /// Total over the threshold pair: exactly one of active/idle/away for any
    /// elapsed duration. The away arm wins when the thresholds are equal.
    fn derive_state(&self, idle_for: Duration) -> ActivityState {
        if idle_for >= self.inner.away_threshold {
            ActivityState::Away
        } else if idle_for >= self.inner.idle_threshold {
            ActivityState::Idle
        } else {
            ActivityState::Active
        }
    }

    fn set_state(&self, new_state: ActivityState) {
        let old_state = {
            let mut shared = self
                .inner
                .shared
                .write()
                .expect("activity shared lock poisoned");
            let old = shared.current_state;
            shared.current_state = new_state;
            old
        };

        if old_state == new_state {
            return;
        }
        debug!("Activity state changed: {old_state} -> {new_state}");

        // Callback runs outside the state lock; it may call back in.
        let callback = self
            .inner
            .callback
            .read()
            .expect("activity callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback.on_state_change(new_state);
        }
    }
}
