use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

/// Snapshot of the foreground window at a point in time. Immutable once
/// produced by a probe.
#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub title: String,
    pub application: String,
    pub process_id: u32,
    pub process_path: String,
    pub is_visible: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    MouseMove,
    MouseClick,
    KeyPress,
}

/// A single input event observed by the OS hooks.
#[derive(Debug, Clone, Copy)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub os: &'static str,
    pub os_version: String,
    pub arch: &'static str,
    pub hostname: String,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform not supported: {0}")]
    Unsupported(&'static str),
    #[error("failed to get foreground window")]
    NoForegroundWindow,
    #[error("failed to install {0} hook")]
    HookInstall(&'static str),
}

/// Receives input events from the OS hooks. Invoked on the hook thread; must
/// not block and must not perform I/O.
pub type ActivitySink = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

/// Platform-specific probe. One concrete backend per OS, selected at build
/// time. Hooks are process-wide: `start_input_monitoring` panics if called
/// while hooks are already installed.
pub trait Platform: Send + Sync {
    /// Snapshot the current foreground window.
    fn active_window(&self) -> Result<WindowInfo>;

    /// Install global mouse + keyboard hooks and route events to `sink`.
    fn start_input_monitoring(&self, sink: ActivitySink) -> Result<()>;

    /// Uninstall the hooks synchronously. Safe to call when monitoring was
    /// never started; must be called before process exit.
    fn stop_input_monitoring(&self);

    /// Stable hardware-derived identifier for this machine.
    fn device_identity(&self) -> Result<String>;

    fn system_info(&self) -> Result<SystemInfo>;

    /// Open `url` in the system default browser without waiting on it.
    fn open_browser(&self, url: &str) -> Result<()>;
}

/// Construct the probe for the build target.
pub fn new_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(windows::WindowsPlatform::new()))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::MacosPlatform::new()))
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxPlatform::new()))
    }
    #[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::Unsupported(std::env::consts::OS).into())
    }
}

pub(crate) fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_default()
}
