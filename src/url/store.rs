use crate::util::threading::{spawn_worker, WorkerHandle};
use anyhow::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Browser identities the store recognises; variants normalise to the first
/// tag that is a substring of the lowercased application name.
const BROWSER_TAGS: &[(&str, &str)] = &[
    ("google chrome", "chrome"),
    ("chromium", "chrome"),
    ("chrome", "chrome"),
    ("mozilla firefox", "firefox"),
    ("firefox", "firefox"),
    ("microsoft edge", "edge"),
    ("edge", "edge"),
    ("safari", "safari"),
    ("opera", "opera"),
    ("brave", "brave"),
    ("vivaldi", "vivaldi"),
];

/// Suffixes a window manager appends to a page title.
const BROWSER_TITLE_SUFFIXES: &[&str] = &[
    " - Google Chrome",
    " - Chrome",
    " - Microsoft Edge",
    " - Edge",
    " - Mozilla Firefox",
    " - Firefox",
    " - Safari",
    " - Opera",
    " - Brave",
    " - Vivaldi",
];

struct UrlInfo {
    url: String,
    stored_at: Instant,
}

struct Inner {
    urls: RwLock<HashMap<String, UrlInfo>>,
    ttl: Duration,
    stop_tx: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<WorkerHandle>>,
}

/// Short-TTL mapping from `normalised_app + ":" + title` to the last URL the
/// browser extension reported. Entries past their TTL are invisible to
/// lookups even before the sweeper removes them.
#[derive(Clone)]
pub struct UrlStore {
    inner: Arc<Inner>,
}

impl UrlStore {
    pub fn new(ttl: Duration) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Inner {
                urls: RwLock::new(HashMap::new()),
                ttl,
                stop_tx: Mutex::new(None),
                sweeper: Mutex::new(None),
            }),
        };

        let (stop_tx, stop_rx) = bounded::<()>(0);
        *store
            .inner
            .stop_tx
            .lock()
            .expect("url store stop lock poisoned") = Some(stop_tx);

        let sweeper_store = store.clone();
        let sweeper = spawn_worker("url-expiry", move || {
            let ticker = tick(SWEEP_INTERVAL);
            loop {
                select! {
                    recv(ticker) -> _ => sweeper_store.sweep(),
                    recv(stop_rx) -> _ => return,
                }
            }
        })?;
        *store
            .inner
            .sweeper
            .lock()
            .expect("url store sweeper lock poisoned") = Some(sweeper);

        Ok(store)
    }

    pub fn store(&self, application: &str, title: &str, url: &str) {
        let key = make_key(application, title);
        debug!("Storing URL: key={key} url={url}");
        self.inner
            .urls
            .write()
            .expect("url map lock poisoned")
            .insert(
                key,
                UrlInfo {
                    url: url.to_string(),
                    stored_at: Instant::now(),
                },
            );
    }

    /// Exact key first, then a fuzzy pass that strips browser suffixes from
    /// both sides and accepts equality or containment either way.
    pub fn lookup(&self, application: &str, title: &str) -> Option<String> {
        let normalized_app = normalize_application(application);
        let urls = self.inner.urls.read().expect("url map lock poisoned");

        let exact_key = format!("{normalized_app}:{title}");
        if let Some(info) = urls.get(&exact_key) {
            if info.stored_at.elapsed() <= self.inner.ttl {
                return Some(info.url.clone());
            }
        }

        let fuzzy_title = strip_browser_suffixes(title);
        let prefix = format!("{normalized_app}:");
        for (key, info) in urls.iter() {
            if info.stored_at.elapsed() > self.inner.ttl {
                continue;
            }
            let Some(stored_title) = key.strip_prefix(&prefix) else {
                continue;
            };
            let stored_title = strip_browser_suffixes(stored_title);
            if stored_title == fuzzy_title
                || stored_title.contains(&fuzzy_title)
                || fuzzy_title.contains(&stored_title)
            {
                debug!("URL fuzzy match: query_title={title} matched_key={key}");
                return Some(info.url.clone());
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.inner.urls.read().expect("url map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let mut urls = self.inner.urls.write().expect("url map lock poisoned");
        let before = urls.len();
        urls.retain(|_, info| info.stored_at.elapsed() <= self.inner.ttl);
        let expired = before - urls.len();
        if expired > 0 {
            debug!("Expired {expired} stored URLs");
        }
    }

    /// Terminates the sweeper and joins it. Idempotent.
    pub fn stop(&self) {
        let stop_tx = self
            .inner
            .stop_tx
            .lock()
            .expect("url store stop lock poisoned")
            .take();
        if stop_tx.is_none() {
            return;
        }
        drop(stop_tx);

        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .expect("url store sweeper lock poisoned")
            .take()
        {
            sweeper.join();
        }
        info!("URL store stopped");
    }
}

fn make_key(application: &str, title: &str) -> String {
    format!("{}:{title}", normalize_application(application))
}

/// Collapse browser-name variants ("Google Chrome", "chromium") onto a fixed
/// tag; unknown applications fall through as lowercase.
pub fn normalize_application(application: &str) -> String {
    let app_lower = application.to_lowercase();
    for (variant, tag) in BROWSER_TAGS {
        if app_lower.contains(variant) {
            return (*tag).to_string();
        }
    }
    app_lower
}

fn strip_browser_suffixes(title: &str) -> String {
    let mut title = title.trim();
    for suffix in BROWSER_TITLE_SUFFIXES {
        if let Some(stripped) = title.strip_suffix(suffix) {
            title = stripped.trim_end();
        }
    }
    title.to_string()
}
