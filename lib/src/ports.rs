use serde::{Deserialize, Serialize};
use std::fmt;

/// Port the relay binds to by default.
pub const RELAY_PORT: u16 = 33445;

/// Lowest port a relay or peer may bind to.
pub const MIN_PORT: u16 = 1024;
/// Highest port a relay or peer may bind to.
pub const MAX_PORT: u16 = 65535;

pub const PEER_A_PORT_RANGE: PortRange = PortRange::new(33500, 33599);
pub const PEER_B_PORT_RANGE: PortRange = PortRange::new(33600, 33699);
/// Range reserved for any additional peers a scenario spins up.
pub const OTHER_PEERS_PORT_RANGE: PortRange = PortRange::new(33700, 33799);

/// Returns true iff `start <= end` and both bounds lie in `[MIN_PORT, MAX_PORT]`.
pub fn validate_port_range(start: u32, end: u32) -> bool {
    let bounds = u32::from(MIN_PORT)..=u32::from(MAX_PORT);
    bounds.contains(&start) && bounds.contains(&end) && start <= end
}

/// An inclusive range of ports an engine instance may bind within.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// A range pinned to exactly one port.
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn is_valid(&self) -> bool {
        validate_port_range(u32::from(self.start), u32::from(self.end))
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
