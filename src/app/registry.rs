use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::app::models::{DeviceEvent, DeviceInfo, EventKind};

pub type Subscriber = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// At most one pending entry per uid. A newer event for the same uid
/// replaces kind and snapshot and resets the deadline, which is what folds
/// an attach/detach flap into a single delivery.
struct Pending {
    kind: EventKind,
    snapshot: DeviceInfo,
    deadline: Instant,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, DeviceInfo>,
    online_since: HashMap<String, SystemTime>,
    pendings: HashMap<String, Pending>,
    queue: VecDeque<DeviceEvent>,
    subscribers: HashMap<u64, Subscriber>,
    next_token: u64,
}

struct Shared {
    state: Mutex<RegistryState>,
    wake: Condvar,
    running: AtomicBool,
    debounce: Duration,
}

/// Device registry with a debounced event state machine. Providers feed raw
/// events through `submit`; a single worker owns all map mutation and fans
/// confirmed events out to subscribers. Callbacks are always invoked with
/// the registry lock released.
pub struct DeviceRegistry {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(debounce: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(RegistryState {
                next_token: 1,
                ..RegistryState::default()
            }),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            debounce,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("device-registry".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn registry worker");

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A consistent copy of the current device list.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        let state = self.lock_state();
        let mut list: Vec<DeviceInfo> = state.devices.values().cloned().collect();
        list.sort_by(|a, b| a.uid.cmp(&b.uid));
        list
    }

    pub fn online_since(&self, uid: &str) -> Option<SystemTime> {
        self.lock_state().online_since.get(uid).copied()
    }

    /// Registers a callback and returns its token (always > 0). Tokens are
    /// allocated from a strictly increasing counter and never reused.
    pub fn subscribe(&self, callback: Subscriber) -> u64 {
        let mut state = self.lock_state();
        let token = state.next_token;
        state.next_token += 1;
        state.subscribers.insert(token, callback);
        token
    }

    /// Idempotent; zero and unknown tokens are a no-op. Removing a
    /// subscriber never renumbers the others.
    pub fn unsubscribe(&self, token: u64) {
        if token == 0 {
            return;
        }
        self.lock_state().subscribers.remove(&token);
    }

    /// Non-blocking enqueue. `InfoUpdated` bypasses the debounce machine and
    /// is fired on the calling thread; attach/detach wake the worker.
    pub fn submit(&self, event: DeviceEvent) {
        match event.kind {
            EventKind::InfoUpdated => {
                let (outgoing, subscribers) = {
                    let mut state = self.lock_state();
                    let outgoing = apply_info_update(&mut state, &event);
                    (outgoing, collect_subscribers(&state))
                };
                fire(&subscribers, &outgoing);
            }
            EventKind::Attach | EventKind::Detach => {
                let mut state = self.lock_state();
                state.queue.push_back(event);
                drop(state);
                self.shared.wake.notify_one();
            }
        }
    }

    /// Idempotent shutdown: the worker drains whatever is queued, drops
    /// pending debounce entries without firing them, and exits.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_all();
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("registry worker panicked during shutdown");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut state = shared.state.lock().unwrap_or_else(|p| p.into_inner());

        loop {
            if !shared.running.load(Ordering::SeqCst) || !state.queue.is_empty() {
                break;
            }
            let now = Instant::now();
            match next_deadline(&state) {
                Some(deadline) if deadline <= now => break,
                Some(deadline) => {
                    let (guard, _timeout) = shared
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|p| p.into_inner());
                    state = guard;
                }
                None => {
                    state = shared.wake.wait(state).unwrap_or_else(|p| p.into_inner());
                }
            }
        }

        let running = shared.running.load(Ordering::SeqCst);

        while let Some(event) = state.queue.pop_front() {
            ingest(&mut state, event, shared.debounce);
        }

        let mut notifications = Vec::new();
        if running {
            resolve_due(&mut state, Instant::now(), &mut notifications);
        }

        let subscribers = if notifications.is_empty() {
            Vec::new()
        } else {
            collect_subscribers(&state)
        };
        drop(state);

        for event in &notifications {
            fire(&subscribers, event);
        }

        if !running {
            return;
        }
    }
}

fn next_deadline(state: &RegistryState) -> Option<Instant> {
    state.pendings.values().map(|p| p.deadline).min()
}

fn ingest(state: &mut RegistryState, event: DeviceEvent, debounce: Duration) {
    let uid = event.info.uid.clone();
    if uid.is_empty() {
        warn!("dropping event without uid");
        return;
    }
    let deadline = Instant::now() + debounce;
    match event.kind {
        EventKind::Attach => {
            let stored = state.devices.entry(uid.clone()).or_insert_with(|| DeviceInfo {
                uid: uid.clone(),
                ..DeviceInfo::default()
            });
            stored.merge_from(&event.info);
            stored.online = true;
            // The pending entry keeps the snapshot captured at event time;
            // subscribers see what the provider reported, not the merge.
            state.pendings.insert(
                uid,
                Pending {
                    kind: EventKind::Attach,
                    snapshot: event.info,
                    deadline,
                },
            );
        }
        EventKind::Detach => {
            if let Some(stored) = state.devices.get_mut(&uid) {
                stored.online = false;
            }
            let mut snapshot = event.info;
            snapshot.online = false;
            state.pendings.insert(
                uid,
                Pending {
                    kind: EventKind::Detach,
                    snapshot,
                    deadline,
                },
            );
        }
        EventKind::InfoUpdated => {
            // Normally handled on the submitter thread; kept here so a
            // queued one still merges instead of being lost.
            apply_info_update(state, &event);
        }
    }
}

fn resolve_due(state: &mut RegistryState, now: Instant, notifications: &mut Vec<DeviceEvent>) {
    let due: Vec<String> = state
        .pendings
        .iter()
        .filter(|(_, pending)| pending.deadline <= now)
        .map(|(uid, _)| uid.clone())
        .collect();

    for uid in due {
        let Some(pending) = state.pendings.remove(&uid) else {
            continue;
        };
        match pending.kind {
            EventKind::Attach => {
                match state.devices.get_mut(&uid) {
                    Some(stored) => stored.online = true,
                    None => {
                        state.devices.insert(uid.clone(), pending.snapshot.clone());
                    }
                }
                state
                    .online_since
                    .entry(uid.clone())
                    .or_insert_with(SystemTime::now);
                debug!(uid = %uid, "device attached");
                notifications.push(DeviceEvent::new(EventKind::Attach, pending.snapshot));
            }
            EventKind::Detach => {
                state.devices.remove(&uid);
                state.online_since.remove(&uid);
                debug!(uid = %uid, "device detached");
                notifications.push(DeviceEvent::new(EventKind::Detach, pending.snapshot));
            }
            EventKind::InfoUpdated => {}
        }
    }
}

/// Merges an InfoUpdated snapshot into the stored record when the uid is
/// known. Registry entries are only ever created by Attach, so an update
/// for an unknown uid is broadcast as-is without being stored.
fn apply_info_update(state: &mut RegistryState, event: &DeviceEvent) -> DeviceEvent {
    match state.devices.get_mut(&event.info.uid) {
        Some(stored) => {
            stored.merge_from(&event.info);
            DeviceEvent::new(EventKind::InfoUpdated, stored.clone())
        }
        None => {
            debug!(uid = %event.info.uid, "info update for unknown device");
            event.clone()
        }
    }
}

fn collect_subscribers(state: &RegistryState) -> Vec<Subscriber> {
    state.subscribers.values().cloned().collect()
}

fn fire(subscribers: &[Subscriber], event: &DeviceEvent) {
    for subscriber in subscribers {
        subscriber(event);
    }
}
