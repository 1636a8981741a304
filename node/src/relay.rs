//! Supervised relay (bootstrap) node.

use peerprobe_lib::{validate_port_range, PortRange, PublicKey, RelayMetrics};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::engine::{EngineFactory, RelayEngine, RelayOptions};
use crate::error::HarnessError;
use crate::lock;
use crate::timing::TimeProvider;
use crate::worker::Worker;

const PEER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub address: String,
    pub port: u16,
    /// Pause between loop start and the health check.
    pub settle_delay: Duration,
    pub udp_enabled: bool,
    pub ipv6_enabled: bool,
}

impl RelayConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            settle_delay: Duration::from_millis(500),
            udp_enabled: true,
            ipv6_enabled: false,
        }
    }
}

/// Point-in-time view of a relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub address: String,
    pub port: u16,
    pub public_key: String,
    pub running: bool,
    pub metrics: RelayMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Created,
    Running,
    Stopped,
}

pub struct RelayNode {
    config: RelayConfig,
    label: String,
    public_key: PublicKey,
    port: u16,
    engine: Arc<Mutex<Box<dyn RelayEngine>>>,
    metrics: Arc<Mutex<RelayMetrics>>,
    state: Mutex<RelayState>,
    worker: Mutex<Option<Worker>>,
    clock: Arc<dyn TimeProvider>,
}

impl RelayNode {
    /// Builds the relay engine bound to exactly `config.port`.
    pub fn create(
        config: RelayConfig,
        factory: &dyn EngineFactory,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, HarnessError> {
        let label = format!("relay {}:{}", config.address, config.port);
        let init_error = |reason: String| HarnessError::Initialization {
            component: label.clone(),
            reason,
        };

        if config.address.trim().is_empty() {
            return Err(init_error("address must not be empty".to_string()));
        }
        let port = u32::from(config.port);
        if !validate_port_range(port, port) {
            return Err(init_error(format!(
                "port {} is outside the allowed range",
                config.port
            )));
        }

        let engine = factory
            .create_relay(RelayOptions {
                address: config.address.clone(),
                port_range: PortRange::single(config.port),
                udp_enabled: config.udp_enabled,
                ipv6_enabled: config.ipv6_enabled,
            })
            .map_err(|e| init_error(e.to_string()))?;

        let public_key = engine.public_key();
        let bound_port = engine.port();
        log_info!(label, "Created with public key {}", public_key);

        Ok(Self {
            config,
            label,
            public_key,
            port: bound_port,
            engine: Arc::new(Mutex::new(engine)),
            metrics: Arc::new(Mutex::new(RelayMetrics::default())),
            state: Mutex::new(RelayState::Created),
            worker: Mutex::new(None),
            clock,
        })
    }

    /// Launches the event loop, waits the settle delay, then verifies the
    /// engine is up. On a failed check the loop is stopped and the engine
    /// released, leaving the relay stopped.
    pub async fn start(&self) -> Result<(), HarnessError> {
        {
            let mut state = lock(&self.state);
            match *state {
                RelayState::Running => return Err(HarnessError::AlreadyRunning(self.label.clone())),
                RelayState::Stopped => return Err(HarnessError::NotRunning(self.label.clone())),
                RelayState::Created => *state = RelayState::Running,
            }
        }

        {
            let mut metrics = lock(&self.metrics);
            *metrics = RelayMetrics {
                started_at: Some(self.clock.now()),
                ..RelayMetrics::default()
            };
        }

        let engine = Arc::clone(&self.engine);
        let metrics = Arc::clone(&self.metrics);
        *lock(&self.worker) = Some(Worker::spawn(|stop| run_relay_loop(engine, metrics, stop)));
        log_info!(self.label, "Event loop started");

        self.clock.sleep(self.config.settle_delay).await;

        if let Err(e) = self.verify() {
            log_error!(self.label, "Failed health check after start: {}", e);
            let worker = lock(&self.worker).take();
            if let Some(worker) = worker {
                if let Err(halt_error) = worker.halt(&self.label).await {
                    log_warn!(self.label, "{}", halt_error);
                }
            }
            lock(&self.engine).kill();
            *lock(&self.state) = RelayState::Stopped;
            return Err(e);
        }

        log_info!(self.label, "Running ({})", self.health_status());
        Ok(())
    }

    /// Checks that the engine reports itself running.
    pub fn verify(&self) -> Result<(), HarnessError> {
        if lock(&self.engine).is_running() {
            Ok(())
        } else {
            Err(HarnessError::Verification {
                component: self.label.clone(),
                reason: "engine reports not running".to_string(),
            })
        }
    }

    /// Stops the loop, waits for it to exit and releases the engine.
    /// Does nothing unless the relay is running.
    pub async fn stop(&self) -> Result<(), HarnessError> {
        if !self.is_running() {
            return Ok(());
        }

        let worker = lock(&self.worker).take();
        let halted = match worker {
            Some(worker) => worker.halt(&self.label).await,
            None => Ok(()),
        };

        lock(&self.engine).kill();
        {
            let mut metrics = lock(&self.metrics);
            if let Some(started_at) = metrics.started_at {
                metrics.uptime = self.clock.elapsed_since(started_at);
            }
            metrics.active_peers = 0;
        }
        *lock(&self.state) = RelayState::Stopped;
        log_info!(self.label, "Stopped");
        halted
    }

    /// Polls the active peer count until it reaches `count`.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> Result<usize, HarnessError> {
        if !self.is_running() {
            return Err(HarnessError::NotRunning(self.label.clone()));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let observed = lock(&self.metrics).active_peers;
            if observed >= count {
                return Ok(observed);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(HarnessError::timeout(
                    &self.label,
                    format!("peers (target {count}, observed {observed})"),
                    timeout,
                ));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.state) == RelayState::Running
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Copy of the current counters, with uptime filled in while running.
    pub fn metrics(&self) -> RelayMetrics {
        let running = self.is_running();
        let mut metrics = lock(&self.metrics).clone();
        if running {
            if let Some(started_at) = metrics.started_at {
                metrics.uptime = self.clock.elapsed_since(started_at);
            }
        }
        metrics
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            address: self.config.address.clone(),
            port: self.port,
            public_key: self.public_key.to_hex(),
            running: self.is_running(),
            metrics: self.metrics(),
        }
    }

    /// One-line summary for logs.
    pub fn health_status(&self) -> String {
        let metrics = self.metrics();
        format!(
            "{} on {}:{}, {} active peers, {} served, {} iterations, up {:?}",
            if self.is_running() { "running" } else { "stopped" },
            self.config.address,
            self.port,
            metrics.active_peers,
            metrics.connections_served,
            metrics.packets_processed,
            metrics.uptime
        )
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

async fn run_relay_loop(
    engine: Arc<Mutex<Box<dyn RelayEngine>>>,
    metrics: Arc<Mutex<RelayMetrics>>,
    mut stop: oneshot::Receiver<()>,
) {
    let period = lock(&engine).iteration_interval().max(MIN_TICK);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let active = {
                    let mut engine = lock(&engine);
                    engine.iterate();
                    engine.active_peers()
                };
                let mut metrics = lock(&metrics);
                metrics.packets_processed += 1;
                if active > metrics.active_peers {
                    metrics.connections_served += (active - metrics.active_peers) as u64;
                }
                metrics.active_peers = active;
            }
        }
    }
}
