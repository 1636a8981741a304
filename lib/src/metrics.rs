use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::keys::PublicKey;

/// Counters kept by a relay's event loop.
///
/// Snapshots are plain values; mutating one never touches the relay.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RelayMetrics {
    /// When the relay's loop was started, on the harness clock.
    #[serde(skip)]
    pub started_at: Option<Instant>,

    /// Time since `started_at` at the moment the snapshot was taken.
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,

    /// Total peers that have joined through this relay.
    pub connections_served: u64,

    /// Number of protocol iterations performed.
    pub packets_processed: u64,

    /// Peers currently attached to the relay.
    pub active_peers: usize,
}

/// Counters kept by a test peer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PeerMetrics {
    #[serde(skip)]
    pub started_at: Option<Instant>,

    #[serde(with = "humantime_serde")]
    pub uptime: Duration,

    pub messages_sent: u64,
    pub messages_received: u64,
    pub contact_requests_sent: u64,
    pub contact_requests_received: u64,

    /// Connected/disconnected transitions observed by the peer's loop.
    pub connection_events: u64,

    /// Events discarded because their queue was full.
    pub dropped_events: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactStatus {
    #[default]
    Offline,
    Online,
    Away,
    Busy,
}

/// What a peer knows about one of its contacts.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRelation {
    pub contact_id: u32,
    pub public_key: PublicKey,
    pub status: ContactStatus,
    pub last_seen: Option<Instant>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ContactRelation {
    pub fn new(contact_id: u32, public_key: PublicKey) -> Self {
        Self {
            contact_id,
            public_key,
            status: ContactStatus::Offline,
            last_seen: None,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Records contact activity at `now` and marks the contact online.
    pub fn touch(&mut self, now: Instant) {
        self.status = ContactStatus::Online;
        self.last_seen = Some(now);
    }
}
