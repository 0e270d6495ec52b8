use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use workbeat::auth::DeviceAuthFlow;
use workbeat::client::ApiClient;
use workbeat::collector::EventCollector;
use workbeat::config::{save_device_token, AppConfig};
use workbeat::database::Database;
use workbeat::device::resolve_device_id;
use workbeat::platform::new_platform;
use workbeat::queue::EventQueue;
use workbeat::service::TrackingService;
use workbeat::tracker::{ActivityTracker, WindowTracker};
use workbeat::url::{UrlIngressServer, UrlStore};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "workbeatd", about = "workbeat desktop tracking agent", version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/local.yaml")]
    config: PathBuf,

    /// Check backend reachability and exit
    #[arg(long)]
    check: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    init_logger(&config.log.level, &config.log.format, &config.env);
    info!(
        "Starting workbeat agent: env={} config_path={}",
        config.env,
        cli.config.display()
    );

    let exit_code = match run(&cli, &config) {
        Ok(code) => code,
        Err(e) => {
            error!("workbeat agent failed: {e:#}");
            1
        }
    };

    // Exit unconditionally: a leaked hook callback or worker must not keep
    // the process alive.
    std::process::exit(exit_code);
}

fn run(cli: &Cli, config: &AppConfig) -> Result<i32> {
    let api_client = Arc::new(ApiClient::new(
        &config.backend.base_url,
        &config.backend.api_key,
        Duration::from_secs(config.backend.timeout),
    )?);

    if cli.check {
        return match api_client.health_check() {
            Ok(()) => {
                info!("Backend is healthy: {}", config.backend.base_url);
                Ok(0)
            }
            Err(e) => {
                error!("Backend health check failed: {e:#}");
                Ok(1)
            }
        };
    }

    let database = Database::open(&config.storage_path)?;
    let platform = new_platform()?;
    if let Ok(system) = platform.system_info() {
        info!(
            "System: os={} os_version={} arch={} hostname={}",
            system.os, system.os_version, system.arch, system.hostname
        );
    }
    let device_id = resolve_device_id(&config.device.id, platform.as_ref());

    let mut device_token = config.auth.device_token.clone();
    if device_token.is_empty() {
        info!("No device token found, starting authorization flow");
        let flow = DeviceAuthFlow::new(
            Arc::clone(&platform),
            config.auth.callback_port,
            &config.backend.base_url,
        );
        let code = flow.authorize_device(&device_id, &config.device.name)?;
        let token = flow.exchange_code(&code, &device_id)?;
        device_token = token.access_token;

        match save_device_token(&cli.config, &device_token) {
            Ok(()) => info!("Device token saved to config"),
            Err(e) => warn!("Failed to save device token to config: {e}"),
        }
    } else {
        info!("Using existing device token");
    }

    if !device_token.is_empty() {
        api_client.set_device_token(&device_token);
        if let Err(e) = database.record_device(&device_id, &config.device.name, &device_token) {
            warn!("Failed to record device registration: {e}");
        }
    }

    let queue = EventQueue::new(&database);

    let (url_store, url_ingress) = if config.server.enabled {
        let store = Arc::new(UrlStore::new(Duration::from_secs(config.server.url_store_ttl))?);
        let ingress = UrlIngressServer::spawn(Arc::clone(&store), config.server.port)?;
        (Some(store), Some(ingress))
    } else {
        info!("URL ingress disabled in configuration");
        (None, None)
    };

    let service = TrackingService::new(
        WindowTracker::new(
            Arc::clone(&platform),
            Duration::from_secs(config.tracking.window_poll_interval),
        ),
        ActivityTracker::new(
            Arc::clone(&platform),
            Duration::from_secs(config.tracking.idle_threshold),
            Duration::from_secs(config.tracking.away_threshold),
        ),
        EventCollector::new(
            config.tracking.batch_size,
            Duration::from_secs(config.tracking.batch_flush_interval),
        ),
        api_client,
        queue,
        url_store.clone(),
        device_id.clone(),
    );

    service.start()?;
    info!(
        "workbeat agent started: device_id={device_id} backend_url={}",
        config.backend.base_url
    );

    wait_for_shutdown_signal()?;
    let status = service.status();
    info!(
        "Shutting down workbeat agent: current_state={} pending_events={} collector_pending={}",
        status.current_state, status.pending_events, status.collector_pending
    );

    if let Some(ingress) = &url_ingress {
        ingress.stop();
    }
    if let Some(store) = &url_store {
        store.stop();
    }

    // The service join can hang on a stuck worker; give it a deadline and
    // force the exit beyond it.
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let stopping = service.clone();
    std::thread::spawn(move || {
        stopping.stop();
        let _ = done_tx.send(());
    });

    match done_rx.recv_timeout(SHUTDOWN_DEADLINE) {
        Ok(()) => {
            info!("workbeat agent stopped");
            Ok(0)
        }
        Err(_) => {
            warn!("Shutdown timeout reached, forcing immediate exit");
            Ok(1)
        }
    }
}

fn wait_for_shutdown_signal() -> Result<()> {
    let (sig_tx, sig_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    })?;
    let _ = sig_rx.recv();
    Ok(())
}

fn init_logger(level: &str, format: &str, env_tag: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);

    if format.eq_ignore_ascii_case("json") {
        let env_tag = env_tag.to_string();
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().as_str(),
                    "target": record.target(),
                    "env": env_tag,
                    "msg": record.args().to_string(),
                })
            )
        });
    }

    builder.init();
}
