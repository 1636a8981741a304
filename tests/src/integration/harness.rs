use peerprobe_lib::ports::{PEER_A_PORT_RANGE, PEER_B_PORT_RANGE};
use peerprobe_lib::PortRange;
use peerprobe_node::{
    HarnessError, LoopbackNetwork, Orchestrator, PeerConfig, RelayConfig, RelayNode,
    SystemClock, TestConfig, TestPeer, TimeProvider,
};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Loop interval for loopback engines in tests
pub const FAST_TICK: Duration = Duration::from_millis(5);

/// A report sink that can be read back after the orchestrator owns it
#[derive(Clone, Default)]
pub struct ReportSink(Arc<Mutex<Vec<u8>>>);

impl ReportSink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for ReportSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds harness components that share one loopback network and clock
pub struct TestHarness {
    network: LoopbackNetwork,
    clock: Arc<dyn TimeProvider>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Harness on a fast-ticking network with the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            network: LoopbackNetwork::new().with_iteration_interval(FAST_TICK),
            clock,
        }
    }

    /// The shared network, for fault injection
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    pub fn clock(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.clock)
    }

    /// Defaults with every delay shortened so a full run takes well under a second
    pub fn fast_config() -> TestConfig {
        TestConfig {
            connection_timeout: Duration::from_secs(2),
            friend_request_timeout: Duration::from_secs(2),
            message_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(20),
            relay_settle_delay: Duration::from_millis(20),
            contact_settle_delay: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(10),
            ..TestConfig::default()
        }
    }

    pub fn relay(&self, port: u16) -> Result<RelayNode, HarnessError> {
        let mut config = RelayConfig::new("127.0.0.1", port);
        config.settle_delay = Duration::from_millis(20);
        RelayNode::create(config, &self.network, self.clock())
    }

    pub fn peer(&self, name: &str, range: PortRange) -> Result<TestPeer, HarnessError> {
        self.peer_with(PeerConfig::new(name, range))
    }

    pub fn peer_with(&self, config: PeerConfig) -> Result<TestPeer, HarnessError> {
        TestPeer::create(config, &self.network, self.clock())
    }

    /// Starts `peer`, bootstraps it to `relay` and waits until it is online
    pub async fn connect(&self, peer: &TestPeer, relay: &RelayNode) -> Result<(), HarnessError> {
        peer.start()?;
        peer.connect_to_relay(relay.address(), relay.port(), &relay.public_key())?;
        peer.wait_for_connection(Duration::from_secs(2)).await
    }

    /// A running relay with Alice and Bob online and mutually added
    pub async fn connected_pair(
        &self,
        relay_port: u16,
    ) -> Result<(RelayNode, TestPeer, TestPeer), HarnessError> {
        let relay = self.relay(relay_port)?;
        relay.start().await?;
        let alice = self.peer("Alice", PEER_A_PORT_RANGE)?;
        let bob = self.peer("Bob", PEER_B_PORT_RANGE)?;
        self.connect(&alice, &relay).await?;
        self.connect(&bob, &relay).await?;

        alice.send_contact_request(&bob.public_key(), "hi")?;
        let request = bob.wait_for_contact_request(Duration::from_secs(2)).await?;
        bob.accept_contact_request(&request.public_key)?;
        Ok((relay, alice, bob))
    }

    /// An orchestrator on this harness whose report is captured
    pub fn orchestrator(&self, config: TestConfig) -> (Orchestrator, ReportSink) {
        let sink = ReportSink::default();
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(self.network.clone()),
            self.clock(),
            Box::new(sink.clone()),
        );
        (orchestrator, sink)
    }
}
