//! Supervised protocol peer.
//!
//! A `TestPeer` owns one peer engine and a background loop that iterates it.
//! Engine callbacks land on bounded queues that test code drains through
//! timeout-bounded waits. Connection state is published on a watch channel.

use peerprobe_lib::{
    validate_port_range, ContactRelation, ContactStatus, PeerMetrics, PortRange, PublicKey,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::engine::{ConnectionStatus, ContactId, EngineFactory, PeerEngine, PeerOptions};
use crate::error::HarnessError;
use crate::lock;
use crate::timing::TimeProvider;
use crate::worker::Worker;

const DEFAULT_QUEUE_CAPACITY: usize = 100;
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: String,
    pub port_range: PortRange,
    pub udp_enabled: bool,
    pub ipv6_enabled: bool,
    pub local_discovery_enabled: bool,
    /// Capacity of each event queue. Events arriving at a full queue are
    /// dropped and counted.
    pub queue_capacity: usize,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, port_range: PortRange) -> Self {
        Self {
            name: name.into(),
            port_range,
            udp_enabled: true,
            ipv6_enabled: false,
            local_discovery_enabled: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRequest {
    pub public_key: PublicKey,
    pub message: String,
    pub received_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub contact_id: ContactId,
    pub text: String,
    pub received_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
    pub status: ConnectionStatus,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Created,
    Started,
    Connected,
    Disconnected,
    Stopped,
}

/// Point-in-time view of a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub public_key: String,
    pub port: u16,
    pub state: PeerState,
    pub connected: bool,
    pub contacts: usize,
    pub metrics: PeerMetrics,
}

/// State written by both the loop and the callbacks.
struct Shared {
    state: PeerState,
    metrics: PeerMetrics,
    contacts: HashMap<ContactId, ContactRelation>,
}

pub struct TestPeer {
    config: PeerConfig,
    public_key: PublicKey,
    port: u16,
    // Lock order: engine before shared. Callbacks take `shared` while the
    // loop holds `engine`.
    engine: Arc<Mutex<Box<dyn PeerEngine>>>,
    shared: Arc<Mutex<Shared>>,
    connected: Arc<watch::Sender<bool>>,
    requests: tokio::sync::Mutex<mpsc::Receiver<ContactRequest>>,
    messages: tokio::sync::Mutex<mpsc::Receiver<IncomingMessage>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events: tokio::sync::Mutex<mpsc::Receiver<ConnectionEvent>>,
    worker: Mutex<Option<Worker>>,
    clock: Arc<dyn TimeProvider>,
}

impl TestPeer {
    /// Builds the engine inside the peer's port range and wires its
    /// callbacks to the event queues.
    pub fn create(
        config: PeerConfig,
        factory: &dyn EngineFactory,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, HarnessError> {
        let init_error = |reason: String| HarnessError::Initialization {
            component: config.name.clone(),
            reason,
        };
        if config.name.trim().is_empty() {
            return Err(init_error("name must not be empty".to_string()));
        }
        let range = config.port_range;
        if !validate_port_range(u32::from(range.start), u32::from(range.end)) {
            return Err(init_error(format!("invalid port range {range}")));
        }

        let mut engine = factory
            .create_peer(PeerOptions {
                name: config.name.clone(),
                port_range: range,
                udp_enabled: config.udp_enabled,
                ipv6_enabled: config.ipv6_enabled,
                local_discovery_enabled: config.local_discovery_enabled,
            })
            .map_err(|e| init_error(e.to_string()))?;

        let capacity = config.queue_capacity.max(1);
        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        let (messages_tx, messages_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (connected, _) = watch::channel(false);

        let shared = Arc::new(Mutex::new(Shared {
            state: PeerState::Created,
            metrics: PeerMetrics::default(),
            contacts: HashMap::new(),
        }));

        {
            let shared = Arc::clone(&shared);
            let clock = Arc::clone(&clock);
            let name = config.name.clone();
            engine.on_contact_request(Box::new(move |public_key, message| {
                lock(&shared).metrics.contact_requests_received += 1;
                log_info!(name, "Contact request from {}", public_key.short());
                let request = ContactRequest {
                    public_key,
                    message,
                    received_at: clock.now(),
                };
                enqueue(&name, &shared, &requests_tx, request, "contact request");
            }));
        }

        {
            let shared = Arc::clone(&shared);
            let clock = Arc::clone(&clock);
            let name = config.name.clone();
            engine.on_message(Box::new(move |contact_id, text| {
                let received_at = clock.now();
                {
                    let mut shared = lock(&shared);
                    shared.metrics.messages_received += 1;
                    if let Some(relation) = shared.contacts.get_mut(&contact_id) {
                        relation.messages_received += 1;
                        relation.touch(received_at);
                    }
                }
                log_debug!(name, "Message from contact {}: {} bytes", contact_id, text.len());
                let message = IncomingMessage {
                    contact_id,
                    text,
                    received_at,
                };
                enqueue(&name, &shared, &messages_tx, message, "message");
            }));
        }

        let public_key = engine.public_key();
        let port = engine.port();
        log_info!(config.name, "Created with public key {} on port {}", public_key, port);

        Ok(Self {
            config,
            public_key,
            port,
            engine: Arc::new(Mutex::new(engine)),
            shared,
            connected: Arc::new(connected),
            requests: tokio::sync::Mutex::new(requests_rx),
            messages: tokio::sync::Mutex::new(messages_rx),
            events_tx,
            events: tokio::sync::Mutex::new(events_rx),
            worker: Mutex::new(None),
            clock,
        })
    }

    /// Sets the display name and launches the iteration loop.
    pub fn start(&self) -> Result<(), HarnessError> {
        {
            let mut shared = lock(&self.shared);
            match shared.state {
                PeerState::Created => {}
                PeerState::Stopped => return Err(HarnessError::NotRunning(self.config.name.clone())),
                _ => return Err(HarnessError::AlreadyRunning(self.config.name.clone())),
            }
            shared.state = PeerState::Started;
            shared.metrics.started_at = Some(self.clock.now());
        }

        lock(&self.engine).set_name(&self.config.name);

        let peer_loop = PeerLoop {
            name: self.config.name.clone(),
            engine: Arc::clone(&self.engine),
            shared: Arc::clone(&self.shared),
            connected: Arc::clone(&self.connected),
            events: self.events_tx.clone(),
            clock: Arc::clone(&self.clock),
        };
        *lock(&self.worker) = Some(Worker::spawn(|stop| peer_loop.run(stop)));
        log_info!(self.config.name, "Event loop started");
        Ok(())
    }

    /// Stops the loop, waits for it, and releases the engine. Safe to call
    /// more than once and on a peer that was never started.
    pub async fn stop(&self) -> Result<(), HarnessError> {
        {
            let mut shared = lock(&self.shared);
            if shared.state == PeerState::Stopped {
                return Ok(());
            }
            shared.state = PeerState::Stopped;
        }

        let worker = lock(&self.worker).take();
        let halted = match worker {
            Some(worker) => worker.halt(&self.config.name).await,
            None => Ok(()),
        };

        lock(&self.engine).kill();
        {
            let mut shared = lock(&self.shared);
            if let Some(started_at) = shared.metrics.started_at {
                shared.metrics.uptime = self.clock.elapsed_since(started_at);
            }
        }
        self.connected.send_replace(false);
        log_info!(self.config.name, "Stopped");
        halted
    }

    fn ensure_usable(&self) -> Result<(), HarnessError> {
        if lock(&self.shared).state == PeerState::Stopped {
            Err(HarnessError::NotRunning(self.config.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Bootstraps to a relay. One engine call, never retried here.
    pub fn connect_to_relay(
        &self,
        address: &str,
        port: u16,
        relay_public_key: &PublicKey,
    ) -> Result<(), HarnessError> {
        self.ensure_usable()?;
        lock(&self.engine)
            .bootstrap(address, port, &relay_public_key.to_hex())
            .map_err(|e| HarnessError::operation(&self.config.name, "connect_to_relay", e))?;
        log_info!(
            self.config.name,
            "Bootstrapped to {}:{} ({})",
            address,
            port,
            relay_public_key.short()
        );
        Ok(())
    }

    pub fn send_contact_request(
        &self,
        public_key: &PublicKey,
        message: &str,
    ) -> Result<ContactId, HarnessError> {
        self.ensure_usable()?;
        let contact_id = lock(&self.engine)
            .add_contact(&public_key.to_hex(), message)
            .map_err(|e| HarnessError::operation(&self.config.name, "send_contact_request", e))?;

        let mut shared = lock(&self.shared);
        shared.metrics.contact_requests_sent += 1;
        shared
            .contacts
            .insert(contact_id, ContactRelation::new(contact_id, *public_key));
        drop(shared);

        log_info!(
            self.config.name,
            "Sent contact request to {} as contact {}",
            public_key.short(),
            contact_id
        );
        Ok(contact_id)
    }

    pub fn accept_contact_request(&self, public_key: &PublicKey) -> Result<ContactId, HarnessError> {
        self.ensure_usable()?;
        let contact_id = lock(&self.engine)
            .add_contact_by_public_key(public_key)
            .map_err(|e| HarnessError::operation(&self.config.name, "accept_contact_request", e))?;

        lock(&self.shared)
            .contacts
            .insert(contact_id, ContactRelation::new(contact_id, *public_key));
        log_info!(
            self.config.name,
            "Accepted {} as contact {}",
            public_key.short(),
            contact_id
        );
        Ok(contact_id)
    }

    /// Sends `text`. Counters only move if the engine accepted it.
    pub fn send_message(&self, contact_id: ContactId, text: &str) -> Result<(), HarnessError> {
        self.ensure_usable()?;
        lock(&self.engine)
            .send_message(contact_id, text)
            .map_err(|e| HarnessError::operation(&self.config.name, "send_message", e))?;

        let now = self.clock.now();
        let mut shared = lock(&self.shared);
        shared.metrics.messages_sent += 1;
        if let Some(relation) = shared.contacts.get_mut(&contact_id) {
            relation.messages_sent += 1;
            relation.last_seen = Some(now);
        }
        Ok(())
    }

    /// Resolves once the loop has seen the engine connected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), HarnessError> {
        self.ensure_usable()?;
        let mut connected = self.connected.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            connected.wait_for(|connected| *connected).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_closed)) => Err(HarnessError::NotRunning(self.config.name.clone())),
            Err(_elapsed) => Err(HarnessError::timeout(&self.config.name, "connection", timeout)),
        }
    }

    pub async fn wait_for_contact_request(
        &self,
        timeout: Duration,
    ) -> Result<ContactRequest, HarnessError> {
        self.ensure_usable()?;
        let received =
            tokio::time::timeout(timeout, async { self.requests.lock().await.recv().await }).await;
        self.expect_event(received, "contact request", timeout)
    }

    pub async fn wait_for_message(&self, timeout: Duration) -> Result<IncomingMessage, HarnessError> {
        self.ensure_usable()?;
        let received =
            tokio::time::timeout(timeout, async { self.messages.lock().await.recv().await }).await;
        self.expect_event(received, "message", timeout)
    }

    fn expect_event<T>(
        &self,
        received: Result<Option<T>, tokio::time::error::Elapsed>,
        operation: &str,
        timeout: Duration,
    ) -> Result<T, HarnessError> {
        match received {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HarnessError::NotRunning(self.config.name.clone())),
            Err(_elapsed) => Err(HarnessError::timeout(&self.config.name, operation, timeout)),
        }
    }

    /// Takes every connection change queued so far.
    pub async fn drain_connection_events(&self) -> Vec<ConnectionEvent> {
        let mut events = self.events.lock().await;
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> PeerState {
        lock(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Copy of the contact map.
    pub fn contacts(&self) -> HashMap<ContactId, ContactRelation> {
        lock(&self.shared).contacts.clone()
    }

    /// Copy of the counters, with uptime filled in while running.
    pub fn metrics(&self) -> PeerMetrics {
        let shared = lock(&self.shared);
        let mut metrics = shared.metrics.clone();
        let live = !matches!(shared.state, PeerState::Created | PeerState::Stopped);
        drop(shared);
        if live {
            if let Some(started_at) = metrics.started_at {
                metrics.uptime = self.clock.elapsed_since(started_at);
            }
        }
        metrics
    }

    pub fn status(&self) -> PeerStatus {
        let state = self.state();
        let contacts = lock(&self.shared).contacts.len();
        PeerStatus {
            name: self.config.name.clone(),
            public_key: self.public_key.to_hex(),
            port: self.port,
            state,
            connected: self.is_connected(),
            contacts,
            metrics: self.metrics(),
        }
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

/// Pushes an event without blocking; a full queue drops it.
fn enqueue<T>(
    name: &str,
    shared: &Mutex<Shared>,
    queue: &mpsc::Sender<T>,
    event: T,
    kind: &str,
) {
    match queue.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            lock(shared).metrics.dropped_events += 1;
            log_warn!(name, "Event queue full, dropping {}", kind);
        }
        Err(TrySendError::Closed(_)) => {
            log_debug!(name, "Event queue closed, discarding {}", kind);
        }
    }
}

struct PeerLoop {
    name: String,
    engine: Arc<Mutex<Box<dyn PeerEngine>>>,
    shared: Arc<Mutex<Shared>>,
    connected: Arc<watch::Sender<bool>>,
    events: mpsc::Sender<ConnectionEvent>,
    clock: Arc<dyn TimeProvider>,
}

impl PeerLoop {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let period = lock(&self.engine).iteration_interval().max(MIN_TICK);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connected = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => self.tick(&mut connected),
            }
        }
    }

    fn tick(&self, connected: &mut bool) {
        let (status, contact_statuses) = {
            let mut engine = lock(&self.engine);
            engine.iterate();
            let ids: Vec<ContactId> = lock(&self.shared).contacts.keys().copied().collect();
            let statuses: Vec<(ContactId, ConnectionStatus)> = ids
                .into_iter()
                .map(|id| (id, engine.contact_connection_status(id)))
                .collect();
            (engine.connection_status(), statuses)
        };

        let now = self.clock.now();
        let is_connected = status.is_connected();
        let flipped = is_connected != *connected;
        {
            let mut shared = lock(&self.shared);
            for (id, contact_status) in contact_statuses {
                if let Some(relation) = shared.contacts.get_mut(&id) {
                    if contact_status.is_connected() {
                        relation.touch(now);
                    } else {
                        relation.status = ContactStatus::Offline;
                    }
                }
            }
            if flipped && shared.state != PeerState::Stopped {
                shared.metrics.connection_events += 1;
                shared.state = if is_connected {
                    PeerState::Connected
                } else {
                    PeerState::Disconnected
                };
            }
        }

        if !flipped {
            return;
        }
        *connected = is_connected;
        self.connected.send_replace(is_connected);
        if is_connected {
            log_info!(self.name, "Connected ({:?})", status);
        } else {
            log_warn!(self.name, "Disconnected");
        }
        let event = ConnectionEvent {
            connected: is_connected,
            status,
            at: now,
        };
        enqueue(&self.name, &self.shared, &self.events, event, "connection event");
    }
}
