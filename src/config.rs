use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub level: String,
    /// "json" for single-line JSON records, anything else for plain text.
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    /// Request timeout in seconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub device_token: String,
    pub callback_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
}

/// All durations in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    pub window_poll_interval: u64,
    pub idle_threshold: u64,
    pub away_threshold: u64,
    pub batch_size: usize,
    pub batch_flush_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    /// TTL for extension-reported URLs, in seconds.
    pub url_store_ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub log: LogConfig,
    pub storage_path: PathBuf,
    pub backend: BackendConfig,
    pub auth: AuthConfig,
    pub device: DeviceConfig,
    pub tracking: TrackingConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Load the YAML file at `path` (if present) over built-in defaults, then
    /// apply `WORKBEAT_`-prefixed environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let default_storage = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".workbeat")
            .join("agent.db");

        let mut builder = Config::builder()
            .set_default("env", "local")?
            .set_default("log.level", "info")?
            .set_default("log.format", "console")?
            .set_default("storage_path", default_storage.to_string_lossy().as_ref())?
            .set_default("backend.base_url", "http://localhost:8080")?
            .set_default("backend.api_key", "")?
            .set_default("backend.timeout", 30)?
            .set_default("auth.device_token", "")?
            .set_default("auth.callback_port", 8765)?
            .set_default("device.id", "")?
            .set_default("device.name", "")?
            .set_default("tracking.window_poll_interval", 2)?
            .set_default("tracking.idle_threshold", 60)?
            .set_default("tracking.away_threshold", 300)?
            .set_default("tracking.batch_size", 10)?
            .set_default("tracking.batch_flush_interval", 30)?
            .set_default("server.enabled", false)?
            .set_default("server.port", 8777)?
            .set_default("server.url_store_ttl", 300)?;

        if path.exists() {
            builder = builder.add_source(File::from(path.to_path_buf()).format(FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix("WORKBEAT")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .with_context(|| format!("failed to load config from {path:?}"))?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tracking.idle_threshold == 0 {
            anyhow::bail!("tracking.idle_threshold must be positive");
        }
        if self.tracking.away_threshold < self.tracking.idle_threshold {
            anyhow::bail!("tracking.away_threshold must be >= tracking.idle_threshold");
        }
        if self.tracking.batch_size == 0 {
            anyhow::bail!("tracking.batch_size must be positive");
        }
        Ok(())
    }
}

/// Rewrite `device_token:` in place under the `auth:` section; insert it
/// right after the section header when the key is absent.
pub fn save_device_token<P: AsRef<Path>>(path: P, token: &str) -> Result<()> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {path:?}"))?;

    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let token_line = format!("  device_token: \"{token}\"");

    let mut found = false;
    for line in lines.iter_mut() {
        if line.trim_start().starts_with("device_token:") {
            *line = token_line.clone();
            found = true;
            break;
        }
    }

    if !found {
        if let Some(pos) = lines.iter().position(|line| line.trim() == "auth:") {
            lines.insert(pos + 1, token_line);
            found = true;
        }
    }

    if !found {
        anyhow::bail!("could not find auth section in config file");
    }

    std::fs::write(path, lines.join("\n"))
        .with_context(|| format!("failed to write config file {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use tempfile::tempdir;

    fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        let guard = LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned");
        let result = f();
        drop(guard);
        result
    }

    const SAMPLE: &str = "env: production\n\
log:\n  level: debug\n  format: json\n\
storage_path: /tmp/workbeat-test/agent.db\n\
backend:\n  base_url: https://api.example.com\n  api_key: key-1\n  timeout: 10\n\
auth:\n  device_token: \"\"\n  callback_port: 9001\n\
device:\n  id: dev-42\n  name: workstation\n\
tracking:\n  window_poll_interval: 1\n  idle_threshold: 30\n  away_threshold: 120\n  batch_size: 5\n  batch_flush_interval: 10\n\
server:\n  enabled: true\n  port: 8900\n  url_store_ttl: 60\n";

    #[test]
    fn missing_file_yields_defaults() {
        with_env_lock(|| {
            let cfg = AppConfig::load("/nonexistent/workbeat.yaml").expect("load");
            assert_eq!(cfg.env, "local");
            assert_eq!(cfg.log.level, "info");
            assert_eq!(cfg.backend.timeout, 30);
            assert_eq!(cfg.tracking.idle_threshold, 60);
            assert_eq!(cfg.tracking.away_threshold, 300);
            assert!(!cfg.server.enabled);
        });
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        with_env_lock(|| {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("local.yaml");
            fs::write(&path, SAMPLE).expect("write");

            let cfg = AppConfig::load(&path).expect("load");
            assert_eq!(cfg.env, "production");
            assert_eq!(cfg.log.format, "json");
            assert_eq!(cfg.backend.base_url, "https://api.example.com");
            assert_eq!(cfg.auth.callback_port, 9001);
            assert_eq!(cfg.device.id, "dev-42");
            assert_eq!(cfg.tracking.batch_size, 5);
            assert!(cfg.server.enabled);
            assert_eq!(cfg.server.url_store_ttl, 60);
        });
    }

    #[test]
    fn environment_overrides_file() {
        with_env_lock(|| {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("local.yaml");
            fs::write(&path, SAMPLE).expect("write");

            set_env("WORKBEAT_TRACKING__BATCH_SIZE", "25");
            set_env("WORKBEAT_SERVER__ENABLED", "false");
            let cfg = AppConfig::load(&path).expect("load");
            remove_env("WORKBEAT_TRACKING__BATCH_SIZE");
            remove_env("WORKBEAT_SERVER__ENABLED");

            assert_eq!(cfg.tracking.batch_size, 25);
            assert!(!cfg.server.enabled);
        });
    }

    #[test]
    fn rejects_inverted_thresholds() {
        with_env_lock(|| {
            let dir = tempdir().expect("tempdir");
            let path = dir.path().join("local.yaml");
            fs::write(
                &path,
                "tracking:\n  idle_threshold: 300\n  away_threshold: 60\n",
            )
            .expect("write");
            assert!(AppConfig::load(&path).is_err());
        });
    }

    #[test]
    fn save_device_token_rewrites_in_place() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("local.yaml");
        fs::write(&path, SAMPLE).expect("write");

        save_device_token(&path, "tok-123").expect("save");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("  device_token: \"tok-123\""));
        assert!(!contents.contains("device_token: \"\""));

        // The rewritten file still parses with the new token.
        with_env_lock(|| {
            let cfg = AppConfig::load(&path).expect("reload");
            assert_eq!(cfg.auth.device_token, "tok-123");
        });
    }

    #[test]
    fn save_device_token_inserts_under_auth_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("local.yaml");
        fs::write(&path, "env: local\nauth:\n  callback_port: 9001\n").expect("write");

        save_device_token(&path, "tok-456").expect("save");
        let contents = fs::read_to_string(&path).expect("read");
        let auth_pos = contents.find("auth:").unwrap();
        let token_pos = contents.find("device_token: \"tok-456\"").unwrap();
        assert!(token_pos > auth_pos);
    }

    #[test]
    fn save_device_token_fails_without_auth_section() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("local.yaml");
        fs::write(&path, "env: local\n").expect("write");
        assert!(save_device_token(&path, "tok").is_err());
    }
}
