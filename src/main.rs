use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use devicewatcher_lib::app::adb::tracker::{AdbTracker, TrackerOptions};
use devicewatcher_lib::app::config::AppConfig;
use devicewatcher_lib::app::logging::init_logging;
use devicewatcher_lib::app::menu::{self, MenuContext};
use devicewatcher_lib::app::models::DeviceEvent;
use devicewatcher_lib::app::notify::{Notifier, NotifySettings};
use devicewatcher_lib::app::registry::DeviceRegistry;

#[cfg(feature = "apple")]
use devicewatcher_lib::app::apple::usbmux::MuxAddr;
#[cfg(feature = "apple")]
use devicewatcher_lib::app::apple::watcher::{AppleWatcher, WatcherOptions};

fn print_help(program: &str) {
    println!("Usage: {program} [--help] [--version]");
    println!();
    println!("Tracks attached Android and Apple devices and backs up Apple");
    println!("handsets over the mobilebackup2 service.");
    println!();
    println!("Environment:");
    println!("  ADB_SERVER_SOCKET=tcp:HOST:PORT   ADB server endpoint");
    println!("  ADB_SERVER_HOST / ADB_HOST        ADB server host");
    println!("  ADB_SERVER_PORT                   ADB server port");
    println!("  LOG_LEVEL_DEBUG=1                 verbose logging");
    println!("  DEVICE_NOTIFY_WEBHOOK             webhook URL for events");
    println!("  DEVICE_NOTIFY_TCP                 host:port NDJSON push");
    println!("  DEVICE_BACKUP_ROOT                backup/catalog root");
    println!("  IDEVICEBACKUP2_EXE                external backup helper (fallback tooling only)");
}

fn main() -> ExitCode {
    let program = std::env::args().next().unwrap_or_else(|| "devicewatcher".to_string());
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help(&program);
                return ExitCode::SUCCESS;
            }
            "--version" | "-v" => {
                println!("devicewatcher {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Usage: {program} [--help] [--version]");
                return ExitCode::from(2);
            }
        }
    }

    init_logging();
    let trace_id = Uuid::new_v4().to_string();
    let config = AppConfig::from_env();
    info!(trace_id = %trace_id, adb = %config.adb_endpoint(), "devicewatcher starting");

    let registry = DeviceRegistry::new(Duration::from_millis(config.debounce_ms));

    let notifier = Notifier::start(NotifySettings {
        webhook_url: config.webhook_url.clone(),
        tcp_endpoint: config.notify_tcp.clone(),
        ..NotifySettings::default()
    });
    let notifier_sink = Arc::clone(&notifier);
    let notify_token = registry.subscribe(Arc::new(move |event: &DeviceEvent| {
        notifier_sink.submit(event);
    }));

    let tracker = AdbTracker::start(
        config.adb_endpoint(),
        Arc::clone(&registry),
        TrackerOptions::default(),
    );

    #[cfg(feature = "apple")]
    let watcher = AppleWatcher::start(
        MuxAddr::from_env(),
        Arc::clone(&registry),
        WatcherOptions::default(),
    );
    #[cfg(not(feature = "apple"))]
    info!("built without the apple feature; Apple device watching disabled");

    let ctx = MenuContext {
        registry: Arc::clone(&registry),
        notifier: Arc::clone(&notifier),
        config,
    };

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    let result = menu::run(&ctx, &mut input, &mut output);

    info!("shutting down");
    tracker.stop();
    #[cfg(feature = "apple")]
    watcher.stop();
    registry.unsubscribe(notify_token);
    registry.stop();
    notifier.stop();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!(error = %err, "menu loop failed");
            ExitCode::FAILURE
        }
    }
}
