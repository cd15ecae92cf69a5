//! Liveness supervisor
//!
//! The only component that reclaims ports and removes clients. Every
//! interval it probes each registered client's port; a dead port is
//! released, its client is told to log in again and is dropped from the
//! registry once the sweep is over.

use std::sync::Arc;
use std::time::Duration;

use stp_core::time::current_time_secs;
use stp_protocol::Command;
use tokio_util::sync::CancellationToken;

use crate::state::BrokerState;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Clients whose port answered
    pub alive: usize,
    /// Ports reclaimed from dead clients
    pub reclaimed: Vec<u16>,
}

pub struct LivenessSupervisor {
    state: Arc<BrokerState>,
    interval: Duration,
}

impl LivenessSupervisor {
    pub fn new(state: Arc<BrokerState>) -> Self {
        let interval = state.config.check_interval;
        Self { state, interval }
    }

    /// Sweep every interval until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Liveness supervisor started, interval {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Liveness supervisor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.reclaimed.is_empty() {
                        tracing::info!(
                            "Sweep: {} alive, reclaimed ports {:?}",
                            report.alive,
                            report.reclaimed
                        );
                    }
                }
            }
        }
    }

    /// Probe every registered client once
    pub async fn sweep(&self) -> SweepReport {
        let clients = self.state.registry.snapshot();
        let mut report = SweepReport::default();
        let mut dead = Vec::new();

        for (index, client) in clients.iter().enumerate() {
            let port = client.port();

            if self.state.pool.ping(port).await {
                client.mark_online(current_time_secs());
                tracing::trace!("Port {} of {} is alive", port, client.name());
                match Command::heart_beat("Ping") {
                    Ok(command) => client.control().notify(command),
                    Err(e) => tracing::error!("Failed to build heartbeat: {}", e),
                }
                report.alive += 1;
                continue;
            }

            tracing::warn!("Port {} of {} is offline", port, client.name());
            client.mark_offline();
            self.state.pool.release(port).await;
            match Command::relogin(format!("check port {} offline", port)) {
                Ok(command) => client.control().notify(command),
                Err(e) => tracing::error!("Failed to build relogin notice: {}", e),
            }
            report.reclaimed.push(port);
            dead.push(index);
        }

        for removed in self.state.registry.remove_indices(dead) {
            tracing::info!(
                "Removed client {} ({}) from registry",
                removed.name(),
                removed.addr()
            );
        }

        report
    }
}
