use super::{hostname, ActivitySink, Platform, PlatformError, SystemInfo, WindowInfo};
use anyhow::Result;
use std::process::Command;

/// Declared stub: foreground-window sampling and input hooks are not
/// implemented on Linux yet. Identity and browser launching still work so the
/// authorisation flow can run.
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for LinuxPlatform {
    fn active_window(&self) -> Result<WindowInfo> {
        Err(PlatformError::Unsupported("linux").into())
    }

    fn start_input_monitoring(&self, _sink: ActivitySink) -> Result<()> {
        Err(PlatformError::Unsupported("linux").into())
    }

    fn stop_input_monitoring(&self) {}

    fn device_identity(&self) -> Result<String> {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let id = contents.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
        }
        let host = hostname();
        if !host.is_empty() {
            return Ok(format!("linux-{host}"));
        }
        Ok("unknown-device".to_string())
    }

    fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            os: "linux",
            os_version: sysinfo::System::os_version().unwrap_or_default(),
            arch: std::env::consts::ARCH,
            hostname: hostname(),
        })
    }

    fn open_browser(&self, url: &str) -> Result<()> {
        for browser in ["xdg-open", "x-www-browser", "firefox", "google-chrome", "chromium"] {
            if Command::new(browser).arg(url).spawn().is_ok() {
                return Ok(());
            }
        }
        Err(anyhow::anyhow!("no browser found"))
    }
}
