use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::apple::backup;
use crate::app::apple::usbmux::{MuxAddr, MuxConnection, MuxDevice, MuxEvent, MuxSocket};
use crate::app::error::WireError;
use crate::app::models::{DeviceEvent, DeviceInfo, DeviceType, EventKind};
use crate::app::registry::DeviceRegistry;

const APPLE_VID: u16 = 0x05ac;
const RECONNECT_SLICE: Duration = Duration::from_millis(100);
const RECONNECT_SLICES: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    /// Probe lockdownd for display metadata after an attach.
    pub enrich: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self { enrich: true }
    }
}

/// usbmuxd Listen subscription feeding Apple attach/detach events into the
/// registry. Cancellation and reconnect mirror the ADB provider: the live
/// socket sits behind a short lock so `stop` can shut it down.
pub struct AppleWatcher {
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<MuxSocket>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AppleWatcher {
    pub fn start(
        addr: MuxAddr,
        registry: Arc<DeviceRegistry>,
        options: WatcherOptions,
    ) -> Arc<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let socket: Arc<Mutex<Option<MuxSocket>>> = Arc::new(Mutex::new(None));

        let worker_running = Arc::clone(&running);
        let worker_socket = Arc::clone(&socket);
        let worker = thread::Builder::new()
            .name("apple-watcher".to_string())
            .spawn(move || run_loop(addr, registry, options, worker_running, worker_socket))
            .expect("failed to spawn apple watcher");

        Arc::new(Self {
            running,
            socket,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let guard = self.socket.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(socket) = guard.as_ref() {
                let _ = socket.shutdown();
            }
        }
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("apple watcher worker panicked during shutdown");
            }
        }
    }
}

impl Drop for AppleWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    addr: MuxAddr,
    registry: Arc<DeviceRegistry>,
    options: WatcherOptions,
    running: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<MuxSocket>>>,
) {
    while running.load(Ordering::SeqCst) {
        match listen_session(&addr, &registry, options, &running, &socket) {
            Ok(()) => {}
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    warn!(error = %err, "usbmux listen session ended");
                }
            }
        }

        {
            let mut guard = socket.lock().unwrap_or_else(|p| p.into_inner());
            *guard = None;
        }

        for _ in 0..RECONNECT_SLICES {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(RECONNECT_SLICE);
        }
    }
}

fn listen_session(
    addr: &MuxAddr,
    registry: &Arc<DeviceRegistry>,
    options: WatcherOptions,
    running: &AtomicBool,
    socket: &Mutex<Option<MuxSocket>>,
) -> Result<(), WireError> {
    let mut connection = MuxConnection::connect_addr(addr)?;
    {
        let mut guard = socket.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(connection.socket_handle()?);
    }

    connection.listen()?;
    info!("usbmux device watching streaming");

    // Detach notifications only carry the numeric device id.
    let mut known: HashMap<u64, String> = HashMap::new();

    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        match connection.next_event()? {
            MuxEvent::Attached(device) => {
                known.insert(device.device_id, device.udid.clone());
                registry.submit(DeviceEvent::new(
                    EventKind::Attach,
                    attach_info(&device),
                ));
                if options.enrich {
                    enrich(registry, &device.udid);
                }
            }
            MuxEvent::Detached { device_id } => match known.remove(&device_id) {
                Some(udid) => {
                    let info = DeviceInfo {
                        device_type: DeviceType::Apple,
                        uid: udid,
                        transport: "USB".to_string(),
                        online: false,
                        ..DeviceInfo::default()
                    };
                    registry.submit(DeviceEvent::new(EventKind::Detach, info));
                }
                None => debug!(device_id, "detach for unknown device id"),
            },
            MuxEvent::Other(kind) => {
                debug!(kind = %kind, "ignoring usbmux event");
            }
        }
    }
}

fn attach_info(device: &MuxDevice) -> DeviceInfo {
    DeviceInfo {
        device_type: DeviceType::Apple,
        uid: device.udid.clone(),
        manufacturer: "Apple".to_string(),
        transport: device.connection_type.clone(),
        vid: APPLE_VID,
        pid: device.product_id,
        online: true,
        ..DeviceInfo::default()
    }
}

/// Lockdown probe submitted as an InfoUpdated. An unpaired or locked
/// device simply stays unenriched.
fn enrich(registry: &Arc<DeviceRegistry>, udid: &str) {
    match backup::test_connection(udid) {
        Ok(info) => registry.submit(DeviceEvent::new(EventKind::InfoUpdated, info)),
        Err(err) => warn!(udid = %udid, error = %err, "lockdown enrichment failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::{Dictionary, Value};
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;

    const WINDOW: Duration = Duration::from_millis(60);
    const WAIT: Duration = Duration::from_secs(3);

    fn read_client_packet(stream: &mut TcpStream) -> Dictionary {
        let mut header = [0u8; 16];
        stream.read_exact(&mut header).expect("header");
        let total = u32::from_le_bytes(header[0..4].try_into().expect("len"));
        let mut payload = vec![0u8; (total - 16) as usize];
        stream.read_exact(&mut payload).expect("payload");
        Value::from_reader(Cursor::new(payload))
            .expect("plist")
            .into_dictionary()
            .expect("dictionary")
    }

    fn write_server_packet(stream: &mut TcpStream, body: Dictionary) {
        let mut payload = Vec::new();
        Value::Dictionary(body)
            .to_writer_xml(&mut payload)
            .expect("encode");
        let total = 16 + payload.len() as u32;
        stream.write_all(&total.to_le_bytes()).expect("len");
        stream.write_all(&1u32.to_le_bytes()).expect("version");
        stream.write_all(&8u32.to_le_bytes()).expect("type");
        stream.write_all(&0u32.to_le_bytes()).expect("tag");
        stream.write_all(&payload).expect("payload");
    }

    fn attached_packet(device_id: u64, udid: &str) -> Dictionary {
        let mut properties = Dictionary::new();
        properties.insert("DeviceID".to_string(), Value::Integer(device_id.into()));
        properties.insert(
            "SerialNumber".to_string(),
            Value::String(udid.to_string()),
        );
        properties.insert(
            "ConnectionType".to_string(),
            Value::String("USB".to_string()),
        );
        properties.insert("ProductID".to_string(), Value::Integer(0x12a8u64.into()));

        let mut packet = Dictionary::new();
        packet.insert(
            "MessageType".to_string(),
            Value::String("Attached".to_string()),
        );
        packet.insert("DeviceID".to_string(), Value::Integer(device_id.into()));
        packet.insert("Properties".to_string(), Value::Dictionary(properties));
        packet
    }

    fn detached_packet(device_id: u64) -> Dictionary {
        let mut packet = Dictionary::new();
        packet.insert(
            "MessageType".to_string(),
            Value::String("Detached".to_string()),
        );
        packet.insert("DeviceID".to_string(), Value::Integer(device_id.into()));
        packet
    }

    fn result_packet() -> Dictionary {
        let mut body = Dictionary::new();
        body.insert(
            "MessageType".to_string(),
            Value::String("Result".to_string()),
        );
        body.insert("Number".to_string(), Value::Integer(0u64.into()));
        body
    }

    #[test]
    fn attach_and_detach_flow_into_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_client_packet(&mut stream);
            assert_eq!(
                request.get("MessageType").and_then(Value::as_string),
                Some("Listen")
            );
            write_server_packet(&mut stream, result_packet());
            write_server_packet(&mut stream, attached_packet(9, "udid-watch"));
            thread::sleep(Duration::from_millis(250));
            write_server_packet(&mut stream, detached_packet(9));
            thread::sleep(Duration::from_millis(400));
        });

        let registry = DeviceRegistry::new(WINDOW);
        let (tx, rx) = mpsc::channel();
        registry.subscribe(Arc::new(move |event: &DeviceEvent| {
            let _ = tx.send(event.clone());
        }));

        let watcher = AppleWatcher::start(
            MuxAddr::Tcp(addr),
            Arc::clone(&registry),
            WatcherOptions { enrich: false },
        );

        let attach = rx.recv_timeout(WAIT).expect("attach");
        assert_eq!(attach.kind, EventKind::Attach);
        assert_eq!(attach.info.uid, "udid-watch");
        assert_eq!(attach.info.device_type, DeviceType::Apple);
        assert_eq!(attach.info.manufacturer, "Apple");
        assert_eq!(attach.info.vid, APPLE_VID);
        assert_eq!(attach.info.pid, 0x12a8);
        assert!(attach.info.online);

        let detach = rx.recv_timeout(WAIT).expect("detach");
        assert_eq!(detach.kind, EventKind::Detach);
        assert_eq!(detach.info.uid, "udid-watch");
        assert!(!detach.info.online);

        watcher.stop();
        registry.stop();
        server.join().expect("server");
    }

    #[test]
    fn stop_is_idempotent_and_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let _ = read_client_packet(&mut stream);
            write_server_packet(&mut stream, result_packet());
            // Hold the stream open; the watcher blocks in next_event.
            thread::sleep(Duration::from_millis(1200));
        });

        let registry = DeviceRegistry::new(WINDOW);
        let watcher = AppleWatcher::start(
            MuxAddr::Tcp(addr),
            Arc::clone(&registry),
            WatcherOptions { enrich: false },
        );
        thread::sleep(Duration::from_millis(200));

        let begun = std::time::Instant::now();
        watcher.stop();
        watcher.stop();
        assert!(begun.elapsed() < Duration::from_secs(2));

        registry.stop();
        server.join().expect("server");
    }
}
