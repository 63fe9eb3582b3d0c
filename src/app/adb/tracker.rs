use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::enrich;
use crate::app::adb::parse::{parse_track_snapshot, TrackedLine};
use crate::app::adb::wire;
use crate::app::error::WireError;
use crate::app::models::{DeviceEvent, DeviceInfo, DeviceType, EventKind};
use crate::app::registry::DeviceRegistry;

const RECONNECT_SLICE: Duration = Duration::from_millis(100);
const RECONNECT_SLICES: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct TrackerOptions {
    /// Fetch getprop enrichment over a second connection when a device
    /// first reports state `device`.
    pub enrich: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self { enrich: true }
    }
}

/// Long-lived `host:track-devices-l` subscription against the local ADB
/// server. Snapshots are diffed against the last known device map and the
/// difference is submitted to the registry.
pub struct AdbTracker {
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AdbTracker {
    pub fn start(
        endpoint: String,
        registry: Arc<DeviceRegistry>,
        options: TrackerOptions,
    ) -> Arc<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let socket: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));

        let worker_running = Arc::clone(&running);
        let worker_socket = Arc::clone(&socket);
        let worker = thread::Builder::new()
            .name("adb-tracker".to_string())
            .spawn(move || {
                run_loop(endpoint, registry, options, worker_running, worker_socket);
            })
            .expect("failed to spawn adb tracker");

        Arc::new(Self {
            running,
            socket,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Idempotent. Shuts the live socket down so a blocked read returns,
    /// then joins the worker.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let guard = self.socket.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(stream) = guard.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("adb tracker worker panicked during shutdown");
            }
        }
    }
}

impl Drop for AdbTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    endpoint: String,
    registry: Arc<DeviceRegistry>,
    options: TrackerOptions,
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
) {
    while running.load(Ordering::SeqCst) {
        match stream_session(&endpoint, &registry, options, &running, &socket) {
            Ok(()) => {}
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    warn!(endpoint = %endpoint, error = %err, "adb tracking session ended");
                }
            }
        }

        {
            let mut guard = socket.lock().unwrap_or_else(|p| p.into_inner());
            *guard = None;
        }

        // Sleep in short slices so stop() is honored within ~a second.
        for _ in 0..RECONNECT_SLICES {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(RECONNECT_SLICE);
        }
    }
}

/// One connection attempt: connect, authenticate the track-devices
/// subscription, then stream snapshots until the socket dies or stop() is
/// called. The known map starts empty each session so that every currently
/// attached device is re-announced after a reconnect.
fn stream_session(
    endpoint: &str,
    registry: &DeviceRegistry,
    options: TrackerOptions,
    running: &AtomicBool,
    socket: &Mutex<Option<TcpStream>>,
) -> Result<(), WireError> {
    debug!(endpoint = %endpoint, "connecting to adb server");
    let mut stream = TcpStream::connect(endpoint)?;
    {
        let mut guard = socket.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(stream.try_clone()?);
    }

    wire::send_request(&mut stream, "host:track-devices-l")?;
    info!(endpoint = %endpoint, "adb device tracking streaming");

    let mut known: HashMap<String, DeviceInfo> = HashMap::new();
    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let payload = wire::read_len_block(&mut stream)?;
        if payload.is_empty() {
            // Zero-length heartbeat.
            continue;
        }
        let text = String::from_utf8_lossy(&payload);
        let fresh = build_device_map(&text);
        let newly_online = diff_and_submit(registry, &known, &fresh);
        known = fresh;

        if options.enrich {
            for serial in newly_online {
                enrich::enrich_device(endpoint, &serial, registry);
            }
        }
    }
}

fn build_device_map(payload: &str) -> HashMap<String, DeviceInfo> {
    let mut fresh = HashMap::new();
    for line in parse_track_snapshot(payload) {
        let info = device_from_line(&line);
        fresh.insert(info.uid.clone(), info);
    }
    fresh
}

fn device_from_line(line: &TrackedLine) -> DeviceInfo {
    let display_name = if line.model.is_empty() {
        line.serial.clone()
    } else {
        format!("{} ({})", line.model, line.serial)
    };
    DeviceInfo {
        device_type: DeviceType::Android,
        uid: line.serial.clone(),
        display_name,
        model: line.model.clone(),
        adb_state: line.state.clone(),
        transport: "USB".to_string(),
        online: line.state == "device",
        ..DeviceInfo::default()
    }
}

/// Emits Attach / InfoUpdated / Detach from the snapshot difference and
/// returns the serials that just became ready for enrichment.
fn diff_and_submit(
    registry: &DeviceRegistry,
    known: &HashMap<String, DeviceInfo>,
    fresh: &HashMap<String, DeviceInfo>,
) -> Vec<String> {
    let mut newly_online = Vec::new();

    for (serial, info) in fresh {
        match known.get(serial) {
            None => {
                registry.submit(DeviceEvent::new(EventKind::Attach, info.clone()));
                if info.online {
                    newly_online.push(serial.clone());
                }
            }
            Some(old) => {
                if old.adb_state != info.adb_state
                    || old.model != info.model
                    || old.online != info.online
                {
                    registry.submit(DeviceEvent::new(EventKind::InfoUpdated, info.clone()));
                    if info.online && !old.online {
                        newly_online.push(serial.clone());
                    }
                }
            }
        }
    }

    for (serial, old) in known {
        if !fresh.contains_key(serial) {
            let mut snapshot = old.clone();
            snapshot.online = false;
            registry.submit(DeviceEvent::new(EventKind::Detach, snapshot));
        }
    }

    newly_online
}
