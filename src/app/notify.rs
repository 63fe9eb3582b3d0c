use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local, SecondsFormat};
use tracing::{debug, warn};

use crate::app::models::DeviceEvent;

const QUEUE_CAP: usize = 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// `http://host[:port]/path` webhook; empty disables the channel.
    pub webhook_url: String,
    /// `host:port` NDJSON endpoint; empty disables the channel.
    pub tcp_endpoint: String,
    /// Linear backoff applied to a channel after a failed delivery.
    pub backoff: Duration,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            tcp_endpoint: String::new(),
            backoff: Duration::from_secs(3),
        }
    }
}

struct QueuedEvent {
    event: DeviceEvent,
    ts: SystemTime,
}

struct NotifyState {
    queue: VecDeque<QueuedEvent>,
    settings: NotifySettings,
    running: bool,
    http_next_allowed: Instant,
    tcp_next_allowed: Instant,
}

struct Inner {
    state: Mutex<NotifyState>,
    wake: Condvar,
}

/// Pushes each registry event as a one-line JSON document to a webhook
/// and/or a local TCP listener. Deliveries are at-most-once per channel;
/// a failing channel backs off instead of retrying. Nothing here may ever
/// block the registry: `submit` only enqueues.
pub struct Notifier {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Notifier {
    pub fn start(settings: NotifySettings) -> Arc<Self> {
        let now = Instant::now();
        let inner = Arc::new(Inner {
            state: Mutex::new(NotifyState {
                queue: VecDeque::new(),
                settings,
                running: true,
                http_next_allowed: now,
                tcp_next_allowed: now,
            }),
            wake: Condvar::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("notifier".to_string())
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn notifier");

        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Non-blocking enqueue with the wall clock captured now. Overflow
    /// drops the event.
    pub fn submit(&self, event: &DeviceEvent) {
        let mut state = self.lock_state();
        if !state.running {
            return;
        }
        if state.queue.len() >= QUEUE_CAP {
            warn!(uid = %event.info.uid, "notifier queue full, dropping event");
            return;
        }
        state.queue.push_back(QueuedEvent {
            event: event.clone(),
            ts: SystemTime::now(),
        });
        drop(state);
        self.inner.wake.notify_one();
    }

    pub fn set_webhook_url(&self, url: &str) {
        self.lock_state().settings.webhook_url = url.trim().to_string();
    }

    pub fn set_tcp_endpoint(&self, endpoint: &str) {
        self.lock_state().settings.tcp_endpoint = endpoint.trim().to_string();
    }

    pub fn settings(&self) -> NotifySettings {
        self.lock_state().settings.clone()
    }

    /// Idempotent; drains nothing, the queue is dropped with the worker.
    pub fn stop(&self) {
        self.lock_state().running = false;
        self.inner.wake.notify_all();
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("notifier worker panicked during shutdown");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NotifyState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let (queued, settings, http_allowed, tcp_allowed) = {
            let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
            loop {
                if !state.running {
                    return;
                }
                if !state.queue.is_empty() {
                    break;
                }
                state = inner.wake.wait(state).unwrap_or_else(|p| p.into_inner());
            }
            let queued = state.queue.pop_front().expect("queue checked non-empty");
            let now = Instant::now();
            (
                queued,
                state.settings.clone(),
                state.http_next_allowed <= now,
                state.tcp_next_allowed <= now,
            )
        };

        let line = event_json_line(&queued.event, queued.ts);

        // Delivery happens with no lock held; only backoff bookkeeping goes
        // back under it.
        if !settings.webhook_url.is_empty() && http_allowed {
            if !send_http_post(&settings.webhook_url, &line) {
                warn!(url = %settings.webhook_url, "webhook delivery failed, backing off");
                let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                state.http_next_allowed = Instant::now() + settings.backoff;
            }
        }

        if !settings.tcp_endpoint.is_empty() && tcp_allowed {
            if !send_tcp_line(&settings.tcp_endpoint, &line) {
                warn!(endpoint = %settings.tcp_endpoint, "tcp delivery failed, backing off");
                let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                state.tcp_next_allowed = Instant::now() + settings.backoff;
            }
        }
    }
}

/// One event as a single JSON line: `ts` in ISO-8601 with the local
/// offset, the event tag, and the device identity fields.
pub fn event_json_line(event: &DeviceEvent, ts: SystemTime) -> String {
    let stamp: DateTime<Local> = ts.into();
    let device = &event.info;
    serde_json::json!({
        "ts": stamp.to_rfc3339_opts(SecondsFormat::Secs, false),
        "event": event.kind.as_tag(),
        "device": {
            "type": device.device_type.as_str(),
            "uid": device.uid,
            "manufacturer": device.manufacturer,
            "model": device.model,
            "osVersion": device.os_version,
            "transport": device.transport,
            "vid": device.vid,
            "pid": device.pid,
        },
    })
    .to_string()
}

struct ParsedUrl {
    host: String,
    port: u16,
    target: String,
}

/// Minimal webhook URL support: `http://host[:port]/path`, scheme optional.
fn parse_http_url(url: &str) -> Option<ParsedUrl> {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let (hostport, target) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (hostport, 80),
    };
    if host.is_empty() {
        return None;
    }
    Some(ParsedUrl {
        host: host.to_string(),
        port,
        target,
    })
}

fn send_http_post(url: &str, body: &str) -> bool {
    let Some(parsed) = parse_http_url(url) else {
        warn!(url = %url, "invalid webhook URL");
        return false;
    };

    let attempt = || -> std::io::Result<()> {
        let mut stream = TcpStream::connect((parsed.host.as_str(), parsed.port))?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            parsed.target,
            parsed.host,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes())?;

        // Best effort: pull some of the response so the peer sees a clean
        // exchange, then drop the connection.
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf);
        Ok(())
    };

    match attempt() {
        Ok(()) => true,
        Err(err) => {
            debug!(url = %url, error = %err, "webhook POST failed");
            false
        }
    }
}

fn send_tcp_line(endpoint: &str, line: &str) -> bool {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        warn!(endpoint = %endpoint, "invalid TCP endpoint");
        return false;
    };
    let Ok(port) = port.parse::<u16>() else {
        warn!(endpoint = %endpoint, "invalid TCP endpoint port");
        return false;
    };

    let attempt = || -> std::io::Result<()> {
        let mut stream = TcpStream::connect((host, port))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    };

    match attempt() {
        Ok(()) => true,
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "tcp push failed");
            false
        }
    }
}
