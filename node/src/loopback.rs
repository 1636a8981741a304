//! In-process protocol engine.
//!
//! Routes contact requests and messages between peers that live in the same
//! process, without sockets. Ports are still reserved so bind conflicts
//! behave like a real host, and relays must be reachable for a peer to come
//! online. Fault knobs let tests fail bootstraps, take a relay down, cut a
//! peer off, or drop messages.

use peerprobe_lib::{generate_keypair, PortRange, PublicKey};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::engine::{
    ConnectionStatus, ContactId, ContactRequestCallback, EngineError, EngineFactory,
    MessageCallback, PeerEngine, PeerOptions, RelayEngine, RelayOptions, MAX_MESSAGE_LENGTH,
};
use crate::lock;

const DEFAULT_ITERATION_INTERVAL: Duration = Duration::from_millis(50);

type RelayKey = (String, u16);

/// A shared, in-memory network that hands out relay and peer engines.
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    iteration_interval: Duration,
}

#[derive(Default)]
struct NetworkState {
    bound_ports: HashSet<u16>,
    relays: HashMap<RelayKey, RelayEntry>,
    peers: HashMap<PublicKey, PeerEntry>,
    faults: FaultPlan,
}

struct RelayEntry {
    public_key: PublicKey,
    healthy: bool,
}

struct PeerEntry {
    name: String,
    udp_enabled: bool,
    relay: Option<RelayKey>,
    joined: bool,
    contacts: BTreeMap<ContactId, PublicKey>,
    next_contact_id: ContactId,
    pending_requests: Vec<(PublicKey, String)>,
    inbox: VecDeque<Delivery>,
}

enum Delivery {
    ContactRequest { from: PublicKey, message: String },
    Message { from: PublicKey, text: String },
}

/// What a peer's callbacks get fired with after one iteration.
enum PeerEvent {
    ContactRequest(PublicKey, String),
    Message(ContactId, String),
}

#[derive(Default)]
struct FaultPlan {
    bootstrap_failures: u32,
    isolated: HashSet<PublicKey>,
    drop_rate: f64,
}

impl PeerEntry {
    fn new(name: String, udp_enabled: bool) -> Self {
        Self {
            name,
            udp_enabled,
            relay: None,
            joined: false,
            contacts: BTreeMap::new(),
            next_contact_id: 0,
            pending_requests: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    fn contact_id_of(&self, key: &PublicKey) -> Option<ContactId> {
        self.contacts
            .iter()
            .find(|(_, contact)| *contact == key)
            .map(|(id, _)| *id)
    }

    fn link_status(&self) -> ConnectionStatus {
        if self.udp_enabled {
            ConnectionStatus::Udp
        } else {
            ConnectionStatus::Tcp
        }
    }

    fn insert_contact(&mut self, key: PublicKey) -> Result<ContactId, EngineError> {
        if self.contact_id_of(&key).is_some() {
            return Err(EngineError::AlreadyContact(key));
        }
        let id = self.next_contact_id;
        self.next_contact_id += 1;
        self.contacts.insert(id, key);
        Ok(id)
    }
}

impl NetworkState {
    fn bind(&mut self, range: PortRange) -> Result<u16, EngineError> {
        if !range.is_valid() {
            return Err(EngineError::InvalidPortRange(range));
        }
        let port = range
            .iter()
            .find(|port| !self.bound_ports.contains(port))
            .ok_or(EngineError::PortUnavailable(range))?;
        self.bound_ports.insert(port);
        Ok(port)
    }

    fn peer_online(&self, key: &PublicKey) -> bool {
        !self.faults.isolated.contains(key) && self.peers.get(key).is_some_and(|peer| peer.joined)
    }

    /// Both ends online and each holds the other as a contact.
    fn contact_online(&self, me: &PublicKey, other: &PublicKey) -> bool {
        self.peer_online(me)
            && self.peer_online(other)
            && self
                .peers
                .get(other)
                .is_some_and(|peer| peer.contact_id_of(me).is_some())
    }

    fn refresh_membership(&mut self, me: &PublicKey) {
        let relay_up = self
            .peers
            .get(me)
            .and_then(|peer| peer.relay.as_ref())
            .and_then(|key| self.relays.get(key))
            .is_some_and(|relay| relay.healthy);
        if let Some(peer) = self.peers.get_mut(me) {
            peer.joined = relay_up;
        }
    }

    fn flush_pending_requests(&mut self, me: &PublicKey) {
        if !self.peer_online(me) {
            return;
        }
        let pending = match self.peers.get_mut(me) {
            Some(peer) => std::mem::take(&mut peer.pending_requests),
            None => return,
        };

        let mut still_pending = Vec::new();
        for (target, message) in pending {
            if !self.peer_online(&target) {
                still_pending.push((target, message));
                continue;
            }
            if let Some(peer) = self.peers.get_mut(&target) {
                peer.inbox.push_back(Delivery::ContactRequest { from: *me, message });
            }
        }

        if let Some(peer) = self.peers.get_mut(me) {
            peer.pending_requests = still_pending;
        }
    }

    fn drain_inbox(&mut self, me: &PublicKey) -> Vec<PeerEvent> {
        let Some(peer) = self.peers.get_mut(me) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        while let Some(delivery) = peer.inbox.pop_front() {
            match delivery {
                Delivery::ContactRequest { from, message } => {
                    // Requests from existing contacts are ignored
                    if peer.contact_id_of(&from).is_none() {
                        events.push(PeerEvent::ContactRequest(from, message));
                    }
                }
                Delivery::Message { from, text } => match peer.contact_id_of(&from) {
                    Some(id) => events.push(PeerEvent::Message(id, text)),
                    None => log::debug!(
                        "[{}] dropping message from non-contact {}",
                        peer.name,
                        from.short()
                    ),
                },
            }
        }
        events
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            iteration_interval: DEFAULT_ITERATION_INTERVAL,
        }
    }

    /// Sets the iteration interval reported by engines created afterwards.
    pub fn with_iteration_interval(mut self, interval: Duration) -> Self {
        self.iteration_interval = interval;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, NetworkState> {
        lock(&self.state)
    }

    /// Makes the next `count` bootstrap calls fail with a transient error.
    pub fn fail_next_bootstraps(&self, count: u32) {
        self.lock_state().faults.bootstrap_failures = count;
    }

    /// Marks a relay healthy or not. Unhealthy relays report themselves as
    /// not running and stop serving peers.
    pub fn set_relay_healthy(&self, address: &str, port: u16, healthy: bool) {
        if let Some(relay) = self
            .lock_state()
            .relays
            .get_mut(&(address.to_string(), port))
        {
            relay.healthy = healthy;
        }
    }

    /// Cuts a peer off: it reports no connection and nothing reaches it.
    pub fn isolate_peer(&self, key: &PublicKey) {
        self.lock_state().faults.isolated.insert(*key);
    }

    pub fn restore_peer(&self, key: &PublicKey) {
        self.lock_state().faults.isolated.remove(key);
    }

    /// Set message drop rate (0.0 = no drops, 1.0 = drop all)
    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.lock_state().faults.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    pub fn relay_count(&self) -> usize {
        self.lock_state().relays.len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock_state().peers.len()
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.lock_state().bound_ports.contains(&port)
    }
}

fn validate_address(address: &str) -> Result<(), EngineError> {
    if address == "localhost" || address.parse::<IpAddr>().is_ok() {
        Ok(())
    } else {
        Err(EngineError::InvalidAddress(address.to_string()))
    }
}

impl EngineFactory for LoopbackNetwork {
    fn create_relay(&self, options: RelayOptions) -> Result<Box<dyn RelayEngine>, EngineError> {
        validate_address(&options.address)?;
        let keys = generate_keypair();

        let mut state = self.lock_state();
        let port = state.bind(options.port_range)?;
        state.relays.insert(
            (options.address.clone(), port),
            RelayEntry {
                public_key: keys.public_key,
                healthy: true,
            },
        );
        drop(state);

        log::debug!(
            "loopback relay {} bound to {}:{}",
            keys.public_key.short(),
            options.address,
            port
        );

        Ok(Box::new(LoopbackRelay {
            network: self.clone(),
            address: options.address,
            port,
            public_key: keys.public_key,
            killed: false,
        }))
    }

    fn create_peer(&self, options: PeerOptions) -> Result<Box<dyn PeerEngine>, EngineError> {
        let keys = generate_keypair();

        let mut state = self.lock_state();
        let port = state.bind(options.port_range)?;
        state.peers.insert(
            keys.public_key,
            PeerEntry::new(options.name.clone(), options.udp_enabled),
        );
        drop(state);

        log::debug!(
            "loopback peer {} ({}) bound to port {}",
            options.name,
            keys.public_key.short(),
            port
        );

        Ok(Box::new(LoopbackPeer {
            network: self.clone(),
            public_key: keys.public_key,
            port,
            contact_request_callback: None,
            message_callback: None,
            killed: false,
        }))
    }
}

pub struct LoopbackRelay {
    network: LoopbackNetwork,
    address: String,
    port: u16,
    public_key: PublicKey,
    killed: bool,
}

impl LoopbackRelay {
    fn key(&self) -> RelayKey {
        (self.address.clone(), self.port)
    }
}

impl RelayEngine for LoopbackRelay {
    fn iterate(&mut self) {}

    fn iteration_interval(&self) -> Duration {
        self.network.iteration_interval
    }

    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_running(&self) -> bool {
        !self.killed
            && self
                .network
                .lock_state()
                .relays
                .get(&self.key())
                .is_some_and(|relay| relay.healthy)
    }

    fn active_peers(&self) -> usize {
        if self.killed {
            return 0;
        }
        let key = self.key();
        let state = self.network.lock_state();
        state
            .peers
            .iter()
            .filter(|(peer_key, peer)| {
                peer.relay.as_ref() == Some(&key) && state.peer_online(peer_key)
            })
            .count()
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        let mut state = self.network.lock_state();
        state.relays.remove(&self.key());
        state.bound_ports.remove(&self.port);
    }
}

impl Drop for LoopbackRelay {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct LoopbackPeer {
    network: LoopbackNetwork,
    public_key: PublicKey,
    port: u16,
    contact_request_callback: Option<ContactRequestCallback>,
    message_callback: Option<MessageCallback>,
    killed: bool,
}

impl LoopbackPeer {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.killed {
            Err(EngineError::Killed)
        } else {
            Ok(())
        }
    }
}

fn check_message(text: &str) -> Result<(), EngineError> {
    if text.is_empty() {
        return Err(EngineError::EmptyMessage);
    }
    if text.len() > MAX_MESSAGE_LENGTH {
        return Err(EngineError::MessageTooLong(text.len()));
    }
    Ok(())
}

impl PeerEngine for LoopbackPeer {
    fn iterate(&mut self) {
        if self.killed {
            return;
        }

        let events = {
            let mut state = self.network.lock_state();
            state.refresh_membership(&self.public_key);
            state.flush_pending_requests(&self.public_key);
            state.drain_inbox(&self.public_key)
        };

        // Callbacks run with the network unlocked
        for event in events {
            match event {
                PeerEvent::ContactRequest(from, message) => {
                    if let Some(callback) = &self.contact_request_callback {
                        callback(from, message);
                    }
                }
                PeerEvent::Message(contact_id, text) => {
                    if let Some(callback) = &self.message_callback {
                        callback(contact_id, text);
                    }
                }
            }
        }
    }

    fn iteration_interval(&self) -> Duration {
        self.network.iteration_interval
    }

    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn set_name(&mut self, name: &str) {
        if let Some(peer) = self.network.lock_state().peers.get_mut(&self.public_key) {
            peer.name = name.to_string();
        }
    }

    fn connection_status(&self) -> ConnectionStatus {
        if self.killed {
            return ConnectionStatus::None;
        }
        let state = self.network.lock_state();
        match state.peers.get(&self.public_key) {
            Some(peer) if state.peer_online(&self.public_key) => peer.link_status(),
            _ => ConnectionStatus::None,
        }
    }

    fn contact_connection_status(&self, contact_id: ContactId) -> ConnectionStatus {
        if self.killed {
            return ConnectionStatus::None;
        }
        let state = self.network.lock_state();
        let Some(peer) = state.peers.get(&self.public_key) else {
            return ConnectionStatus::None;
        };
        match peer.contacts.get(&contact_id) {
            Some(other) if state.contact_online(&self.public_key, other) => peer.link_status(),
            _ => ConnectionStatus::None,
        }
    }

    fn bootstrap(
        &mut self,
        address: &str,
        port: u16,
        public_key_hex: &str,
    ) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let mut state = self.network.lock_state();

        if state.faults.bootstrap_failures > 0 {
            state.faults.bootstrap_failures -= 1;
            return Err(EngineError::Transient(
                "simulated bootstrap failure".to_string(),
            ));
        }

        let key = (address.to_string(), port);
        let relay = state
            .relays
            .get(&key)
            .ok_or_else(|| EngineError::RelayUnreachable {
                address: address.to_string(),
                port,
            })?;
        let expected = PublicKey::from_hex(public_key_hex)
            .map_err(|e| EngineError::InvalidPublicKey(e.to_string()))?;
        if expected != relay.public_key {
            return Err(EngineError::RelayKeyMismatch {
                address: address.to_string(),
                port,
                key: expected.short(),
            });
        }

        if let Some(peer) = state.peers.get_mut(&self.public_key) {
            peer.relay = Some(key);
        }
        Ok(())
    }

    fn add_contact(&mut self, id: &str, message: &str) -> Result<ContactId, EngineError> {
        self.ensure_alive()?;
        let target =
            PublicKey::from_hex(id).map_err(|e| EngineError::InvalidPublicKey(e.to_string()))?;
        if target == self.public_key {
            return Err(EngineError::OwnKey);
        }
        check_message(message)?;

        let mut state = self.network.lock_state();
        let peer = state
            .peers
            .get_mut(&self.public_key)
            .ok_or(EngineError::Killed)?;
        let contact_id = peer.insert_contact(target)?;
        peer.pending_requests.push((target, message.to_string()));
        Ok(contact_id)
    }

    fn add_contact_by_public_key(&mut self, public_key: &PublicKey) -> Result<ContactId, EngineError> {
        self.ensure_alive()?;
        if *public_key == self.public_key {
            return Err(EngineError::OwnKey);
        }

        let mut state = self.network.lock_state();
        let peer = state
            .peers
            .get_mut(&self.public_key)
            .ok_or(EngineError::Killed)?;
        peer.insert_contact(*public_key)
    }

    fn send_message(&mut self, contact_id: ContactId, text: &str) -> Result<(), EngineError> {
        self.ensure_alive()?;
        check_message(text)?;

        let mut state = self.network.lock_state();
        let target = state
            .peers
            .get(&self.public_key)
            .and_then(|peer| peer.contacts.get(&contact_id))
            .copied()
            .ok_or(EngineError::UnknownContact(contact_id))?;
        if !state.contact_online(&self.public_key, &target) {
            return Err(EngineError::ContactOffline(contact_id));
        }

        // Simulate message loss
        let drop_rate = state.faults.drop_rate;
        if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
            log::debug!("loopback dropped message to {}", target.short());
            return Ok(());
        }

        if let Some(peer) = state.peers.get_mut(&target) {
            peer.inbox.push_back(Delivery::Message {
                from: self.public_key,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    fn on_contact_request(&mut self, callback: ContactRequestCallback) {
        self.contact_request_callback = Some(callback);
    }

    fn on_message(&mut self, callback: MessageCallback) {
        self.message_callback = Some(callback);
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        self.contact_request_callback = None;
        self.message_callback = None;
        let mut state = self.network.lock_state();
        state.peers.remove(&self.public_key);
        state.bound_ports.remove(&self.port);
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        self.kill();
    }
}
