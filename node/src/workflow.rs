//! The four-phase interoperability scenario.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::TestConfig;
use crate::engine::{ContactId, EngineFactory};
use crate::error::HarnessError;
use crate::peer::{PeerStatus, TestPeer};
use crate::relay::{RelayNode, RelayStatus};
use crate::retry::retry_operation;
use crate::timing::TimeProvider;

pub const CONTACT_REQUEST_MESSAGE: &str = "Hello! This is a test friend request from Alice.";
pub const FIRST_MESSAGE: &str = "Hello Alice! This is Bob's first message.";
pub const REPLY_MESSAGE: &str = "Hi Bob! This is Alice's reply message.";

const LABEL: &str = "workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    NetworkInitialization,
    PeerSetup,
    ContactEstablishment,
    MessageExchange,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 4] = [
        Phase::NetworkInitialization,
        Phase::PeerSetup,
        Phase::ContactEstablishment,
        Phase::MessageExchange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::NetworkInitialization => "Network Initialization",
            Phase::PeerSetup => "Peer Setup",
            Phase::ContactEstablishment => "Contact Establishment",
            Phase::MessageExchange => "Message Exchange",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of every component, captured at the end of a successful run.
#[derive(Debug, Serialize)]
struct FinalMetrics {
    relay: RelayStatus,
    peers: Vec<PeerStatus>,
}

/// Drives one relay and two peers through the phases in order.
///
/// Components are created lazily by the phases and kept until the workflow
/// is dropped, so their final state can be inspected after `execute`.
pub struct Workflow {
    config: TestConfig,
    factory: Arc<dyn EngineFactory>,
    clock: Arc<dyn TimeProvider>,
    relay: Option<RelayNode>,
    peer_a: Option<TestPeer>,
    peer_b: Option<TestPeer>,
    completed: Vec<Phase>,
    final_metrics: Option<serde_json::Value>,
    cleanup_warning: Option<HarnessError>,
}

impl Workflow {
    pub fn new(
        config: TestConfig,
        factory: Arc<dyn EngineFactory>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            factory,
            clock,
            relay: None,
            peer_a: None,
            peer_b: None,
            completed: Vec::new(),
            final_metrics: None,
            cleanup_warning: None,
        }
    }

    /// Runs every phase, then cleans up regardless of the outcome.
    ///
    /// No phase starts once `deadline` has passed. A cleanup failure is kept
    /// as a warning (see [`Workflow::take_cleanup_warning`]) and never
    /// replaces the phase result.
    pub async fn execute(&mut self, deadline: Option<Instant>) -> Result<(), HarnessError> {
        let outcome = self.run_phases(deadline).await;
        if let Err(e) = &outcome {
            log_error!(LABEL, "{}", e);
        }

        if let Err(cleanup_error) = self.cleanup().await {
            log_warn!(LABEL, "{}", cleanup_error);
            self.cleanup_warning = Some(cleanup_error);
        }
        outcome
    }

    async fn run_phases(&mut self, deadline: Option<Instant>) -> Result<(), HarnessError> {
        for (index, phase) in Phase::ALL.into_iter().enumerate() {
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                return Err(HarnessError::DeadlineExceeded { phase: phase.name() });
            }

            log_info!(LABEL, "Phase {}/{}: {}", index + 1, Phase::ALL.len(), phase);
            let started = self.clock.now();
            self.run_phase(phase)
                .await
                .map_err(|e| HarnessError::Phase {
                    phase: phase.name(),
                    source: Box::new(e),
                })?;
            self.completed.push(phase);
            log_info!(
                LABEL,
                "{} completed in {:?}",
                phase,
                self.clock.elapsed_since(started)
            );
        }
        Ok(())
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<(), HarnessError> {
        match phase {
            Phase::NetworkInitialization => self.initialize_network().await,
            Phase::PeerSetup => self.setup_peers().await,
            Phase::ContactEstablishment => self.establish_contact().await,
            Phase::MessageExchange => self.exchange_messages().await,
        }
    }

    async fn initialize_network(&mut self) -> Result<(), HarnessError> {
        let relay = RelayNode::create(
            self.config.relay_config(),
            self.factory.as_ref(),
            Arc::clone(&self.clock),
        )?;
        // Stored before starting so cleanup sees it even if start fails
        let relay = self.relay.insert(relay);
        relay.start().await?;
        log_info!(LABEL, "Relay health: {}", relay.health_status());
        Ok(())
    }

    async fn setup_peers(&mut self) -> Result<(), HarnessError> {
        let peer_a = TestPeer::create(
            self.config.peer_config(&self.config.peer_a),
            self.factory.as_ref(),
            Arc::clone(&self.clock),
        )?;
        self.peer_a.insert(peer_a).start()?;

        let peer_b = TestPeer::create(
            self.config.peer_config(&self.config.peer_b),
            self.factory.as_ref(),
            Arc::clone(&self.clock),
        )?;
        self.peer_b.insert(peer_b).start()?;

        let relay = created(&self.relay, "relay")?;
        let peer_a = created(&self.peer_a, &self.config.peer_a.name)?;
        let peer_b = created(&self.peer_b, &self.config.peer_b.name)?;

        let address = relay.address();
        let port = relay.port();
        let relay_key = relay.public_key();
        let policy = self.config.retry_policy();

        for peer in [peer_a, peer_b] {
            let operation = format!("{} connect_to_relay", peer.name());
            retry_operation(&policy, self.clock.as_ref(), &operation, move || async move {
                peer.connect_to_relay(address, port, &relay_key)
            })
            .await?;
        }

        // A before B
        let timeout = self.config.connection_timeout;
        peer_a.wait_for_connection(timeout).await?;
        log_info!(LABEL, "{} connected", peer_a.name());
        peer_b.wait_for_connection(timeout).await?;
        log_info!(LABEL, "{} connected", peer_b.name());
        Ok(())
    }

    async fn establish_contact(&mut self) -> Result<(), HarnessError> {
        let peer_a = created(&self.peer_a, &self.config.peer_a.name)?;
        let peer_b = created(&self.peer_b, &self.config.peer_b.name)?;
        let key_a = peer_a.public_key();

        peer_a.send_contact_request(&peer_b.public_key(), CONTACT_REQUEST_MESSAGE)?;

        let request = peer_b
            .wait_for_contact_request(self.config.friend_request_timeout)
            .await?;
        if request.public_key != key_a {
            return Err(HarnessError::Validation(format!(
                "{} received a contact request from {} instead of {}",
                peer_b.name(),
                request.public_key.short(),
                key_a.short()
            )));
        }
        if request.message != CONTACT_REQUEST_MESSAGE {
            return Err(HarnessError::Validation(format!(
                "{} received contact request text {:?}",
                peer_b.name(),
                request.message
            )));
        }

        peer_b.accept_contact_request(&request.public_key)?;
        self.clock.sleep(self.config.contact_settle_delay).await;

        for peer in [peer_a, peer_b] {
            if peer.contacts().is_empty() {
                return Err(HarnessError::Validation(format!(
                    "{} has no contacts after the exchange",
                    peer.name()
                )));
            }
        }
        Ok(())
    }

    async fn exchange_messages(&mut self) -> Result<(), HarnessError> {
        let relay = created(&self.relay, "relay")?;
        let peer_a = created(&self.peer_a, &self.config.peer_a.name)?;
        let peer_b = created(&self.peer_b, &self.config.peer_b.name)?;

        let policy = self.config.retry_policy();
        let clock = self.clock.as_ref();
        let timeout = self.config.message_timeout;

        for (sender, receiver, text) in [
            (peer_b, peer_a, FIRST_MESSAGE),
            (peer_a, peer_b, REPLY_MESSAGE),
        ] {
            let contact_id = contact_id_for(sender, receiver)?;
            let operation = format!("{} send_message", sender.name());
            retry_operation(&policy, clock, &operation, move || async move {
                sender.send_message(contact_id, text)
            })
            .await?;

            let message = receiver.wait_for_message(timeout).await?;
            let from = receiver
                .contacts()
                .get(&message.contact_id)
                .map(|relation| relation.public_key);
            if from != Some(sender.public_key()) {
                return Err(HarnessError::Validation(format!(
                    "{} received a message from contact {} instead of {}",
                    receiver.name(),
                    message.contact_id,
                    sender.name()
                )));
            }
            if message.text != text {
                return Err(HarnessError::Validation(format!(
                    "{} expected {:?} but received {:?}",
                    receiver.name(),
                    text,
                    message.text
                )));
            }
            log_info!(LABEL, "{} -> {}: {:?}", sender.name(), receiver.name(), text);
        }

        let summary = FinalMetrics {
            relay: relay.status(),
            peers: vec![peer_a.status(), peer_b.status()],
        };
        match serde_json::to_value(&summary) {
            Ok(value) => {
                log_info!(LABEL, "Final metrics: {}", value);
                self.final_metrics = Some(value);
            }
            Err(e) => log_warn!(LABEL, "Could not serialize final metrics: {}", e),
        }
        Ok(())
    }

    /// Stops both peers and the relay, each independently. Safe to call
    /// repeatedly and before anything was created.
    pub async fn cleanup(&mut self) -> Result<(), HarnessError> {
        let mut errors = Vec::new();

        for peer in [&self.peer_a, &self.peer_b].into_iter().flatten() {
            if let Err(e) = peer.stop().await {
                errors.push(e);
            }
        }
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.stop().await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Cleanup(errors))
        }
    }

    pub fn completed_phases(&self) -> &[Phase] {
        &self.completed
    }

    /// Component snapshot taken at the end of the message exchange.
    pub fn final_metrics(&self) -> Option<&serde_json::Value> {
        self.final_metrics.as_ref()
    }

    pub fn take_cleanup_warning(&mut self) -> Option<HarnessError> {
        self.cleanup_warning.take()
    }

    pub fn relay(&self) -> Option<&RelayNode> {
        self.relay.as_ref()
    }

    pub fn peer_a(&self) -> Option<&TestPeer> {
        self.peer_a.as_ref()
    }

    pub fn peer_b(&self) -> Option<&TestPeer> {
        self.peer_b.as_ref()
    }
}

fn created<'a, T>(slot: &'a Option<T>, component: &str) -> Result<&'a T, HarnessError> {
    slot.as_ref().ok_or_else(|| HarnessError::Initialization {
        component: component.to_string(),
        reason: "not created".to_string(),
    })
}

/// The id `sender` holds for `receiver`.
fn contact_id_for(sender: &TestPeer, receiver: &TestPeer) -> Result<ContactId, HarnessError> {
    let key = receiver.public_key();
    sender
        .contacts()
        .into_values()
        .find(|relation| relation.public_key == key)
        .map(|relation| relation.contact_id)
        .ok_or_else(|| {
            HarnessError::Validation(format!(
                "{} has no contact entry for {}",
                sender.name(),
                receiver.name()
            ))
        })
}
