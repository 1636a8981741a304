//! The narrow interface the harness drives a protocol engine through.
//!
//! Engine calls are synchronous: `iterate` performs one unit of protocol
//! work and fires any registered callbacks before returning. Callbacks are
//! invoked on whatever thread is iterating, so they must not block.

use peerprobe_lib::{PortRange, PublicKey};
use std::time::Duration;
use thiserror::Error;

/// Engine-assigned handle for a contact, local to one peer.
pub type ContactId = u32;

/// Longest message body an engine accepts, in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 1372;

pub type ContactRequestCallback = Box<dyn Fn(PublicKey, String) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(ContactId, String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    None,
    Tcp,
    Udp,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self != ConnectionStatus::None
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub address: String,
    pub port_range: PortRange,
    pub udp_enabled: bool,
    pub ipv6_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub name: String,
    pub port_range: PortRange,
    pub udp_enabled: bool,
    pub ipv6_enabled: bool,
    pub local_discovery_enabled: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid port range {0}")]
    InvalidPortRange(PortRange),

    #[error("no free port in range {0}")]
    PortUnavailable(PortRange),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("no relay listening on {address}:{port}")]
    RelayUnreachable { address: String, port: u16 },

    #[error("relay at {address}:{port} does not own key {key}")]
    RelayKeyMismatch {
        address: String,
        port: u16,
        key: String,
    },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("cannot add own key as a contact")]
    OwnKey,

    #[error("contact {0:?} already added")]
    AlreadyContact(PublicKey),

    #[error("unknown contact {0}")]
    UnknownContact(ContactId),

    #[error("contact {0} is not online")]
    ContactOffline(ContactId),

    #[error("message is empty")]
    EmptyMessage,

    #[error("message of {0} bytes exceeds the 1372 byte limit")]
    MessageTooLong(usize),

    #[error("instance has been killed")]
    Killed,

    #[error("transient failure: {0}")]
    Transient(String),
}

/// A relay (bootstrap) instance.
#[cfg_attr(test, mockall::automock)]
pub trait RelayEngine: Send {
    /// Performs one protocol iteration.
    fn iterate(&mut self);

    /// How long to wait between iterations.
    fn iteration_interval(&self) -> Duration;

    fn public_key(&self) -> PublicKey;

    /// The port the instance actually bound.
    fn port(&self) -> u16;

    fn is_running(&self) -> bool;

    /// Peers currently attached through this relay.
    fn active_peers(&self) -> usize;

    /// Releases the instance. Further calls are no-ops.
    fn kill(&mut self);
}

/// A peer instance under test.
#[cfg_attr(test, mockall::automock)]
pub trait PeerEngine: Send {
    fn iterate(&mut self);

    fn iteration_interval(&self) -> Duration;

    fn public_key(&self) -> PublicKey;

    fn port(&self) -> u16;

    fn set_name(&mut self, name: &str);

    fn connection_status(&self) -> ConnectionStatus;

    fn contact_connection_status(&self, contact_id: ContactId) -> ConnectionStatus;

    fn bootstrap(&mut self, address: &str, port: u16, public_key_hex: &str)
        -> Result<(), EngineError>;

    /// Sends a contact request to the peer identified by `id`.
    fn add_contact(&mut self, id: &str, message: &str) -> Result<ContactId, EngineError>;

    /// Adds a contact without a request, e.g. to accept one.
    fn add_contact_by_public_key(&mut self, public_key: &PublicKey)
        -> Result<ContactId, EngineError>;

    fn send_message(&mut self, contact_id: ContactId, text: &str) -> Result<(), EngineError>;

    fn on_contact_request(&mut self, callback: ContactRequestCallback);

    fn on_message(&mut self, callback: MessageCallback);

    fn kill(&mut self);
}

/// Creates engine instances.
#[cfg_attr(test, mockall::automock)]
pub trait EngineFactory: Send + Sync {
    fn create_relay(&self, options: RelayOptions) -> Result<Box<dyn RelayEngine>, EngineError>;

    fn create_peer(&self, options: PeerOptions) -> Result<Box<dyn PeerEngine>, EngineError>;
}
