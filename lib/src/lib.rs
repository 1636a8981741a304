// Shared types for the peerprobe harness
pub mod keys;
pub mod metrics;
pub mod ports;
pub mod report;

pub use keys::{generate_keypair, Keypair, KeyError, PublicKey};
pub use metrics::{ContactRelation, ContactStatus, PeerMetrics, RelayMetrics};
pub use ports::{validate_port_range, PortRange};
pub use report::{Results, StepResult, StepStatus};
