use super::{hostname, ActivitySink, Platform, PlatformError, SystemInfo, WindowInfo};
use anyhow::Result;
use std::process::Command;

/// Declared stub: foreground-window sampling and input hooks are not
/// implemented on macOS yet.
pub struct MacosPlatform;

impl MacosPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Platform for MacosPlatform {
    fn active_window(&self) -> Result<WindowInfo> {
        Err(PlatformError::Unsupported("macos").into())
    }

    fn start_input_monitoring(&self, _sink: ActivitySink) -> Result<()> {
        Err(PlatformError::Unsupported("macos").into())
    }

    fn stop_input_monitoring(&self) {}

    fn device_identity(&self) -> Result<String> {
        if let Ok(output) = Command::new("system_profiler")
            .arg("SPHardwareDataType")
            .output()
        {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                for line in text.lines() {
                    if line.contains("Hardware UUID") {
                        if let Some(value) = line.splitn(2, ':').nth(1) {
                            return Ok(value.trim().to_string());
                        }
                    }
                }
            }
        }
        let host = hostname();
        if !host.is_empty() {
            return Ok(format!("darwin-{host}"));
        }
        Ok("unknown-device".to_string())
    }

    fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            os: "darwin",
            os_version: sysinfo::System::os_version().unwrap_or_default(),
            arch: std::env::consts::ARCH,
            hostname: hostname(),
        })
    }

    fn open_browser(&self, url: &str) -> Result<()> {
        Command::new("open").arg(url).spawn()?;
        Ok(())
    }
}
