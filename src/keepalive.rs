//! Life bit handshake that keeps the wallbox failsafe from engaging
//!
//! The supervisor writes the set value to the life bit register, then polls
//! the register until the wallbox clears it again. Each confirmed clear
//! completes one cycle and the next one starts right away. A missing clear
//! is a soft failure; only I/O problems pause the loop until the connection
//! is back. All register access goes through the shared
//! [`ConnectionManager`], so the handshake never interleaves with polling.

use crate::catalog::RegisterKind;
use crate::config::KeepAliveConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::WallboxError;
use crate::logging::{StructuredLogger, get_logger};
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum KeepAlivePhase {
    /// Waiting for the first successful poll or for the connection to return
    #[default]
    Idle,
    /// About to write the set value
    Armed,
    /// Set value written, waiting for the device to clear it
    Cycling,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeepAliveState {
    pub phase: KeepAlivePhase,
    pub last_write_time: Option<DateTime<Utc>>,
    /// When the device was last seen clearing the register
    pub last_observed_echo: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub completed_cycles: u64,
}

enum CycleOutcome {
    Confirmed,
    NotCleared,
    ConnectionLost(String),
    Cancelled,
}

pub struct KeepAliveSupervisor {
    connection: Arc<ConnectionManager>,
    config: KeepAliveConfig,
    state_tx: watch::Sender<KeepAliveState>,
    logger: StructuredLogger,
}

impl KeepAliveSupervisor {
    pub fn new(connection: Arc<ConnectionManager>, config: &KeepAliveConfig) -> Self {
        let (state_tx, _) = watch::channel(KeepAliveState::default());
        Self {
            connection,
            config: config.clone(),
            state_tx,
            logger: get_logger("keepalive"),
        }
    }

    pub fn state(&self) -> KeepAliveState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<KeepAliveState> {
        self.state_tx.subscribe()
    }

    const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    fn update<F: FnOnce(&mut KeepAliveState)>(&self, f: F) {
        self.state_tx.send_modify(f);
    }

    /// Spawn the supervisor loop
    ///
    /// The loop waits until `snapshots` carries a first snapshot and runs
    /// until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(snapshots, cancel).await })
    }

    pub async fn run(
        &self,
        mut snapshots: watch::Receiver<Option<Arc<Snapshot>>>,
        cancel: CancellationToken,
    ) {
        self.logger.info("Waiting for first successful poll");
        tokio::select! {
            _ = cancel.cancelled() => return,
            ready = async { snapshots.wait_for(Option::is_some).await.is_ok() } => {
                if !ready {
                    self.logger.warn("Snapshot channel closed before first poll");
                    return;
                }
            }
        }

        self.logger.info(&format!(
            "Keep-alive started on register {} every {}ms",
            self.config.register, self.config.poll_interval_ms
        ));

        loop {
            self.update(|s| s.phase = KeepAlivePhase::Armed);

            match self.cycle(&cancel).await {
                CycleOutcome::Confirmed => {
                    let now = Utc::now();
                    self.update(|s| {
                        s.last_observed_echo = Some(now);
                        s.consecutive_failures = 0;
                        s.completed_cycles += 1;
                    });
                    self.logger.trace("Keep-alive cycle confirmed");
                }
                CycleOutcome::NotCleared => {
                    self.update(|s| s.consecutive_failures += 1);
                    self.logger.warn(&format!(
                        "Wallbox did not clear the life bit within {} polls; re-arming",
                        self.config.max_polls
                    ));
                }
                CycleOutcome::ConnectionLost(reason) => {
                    self.update(|s| {
                        s.consecutive_failures += 1;
                        s.phase = KeepAlivePhase::Idle;
                    });
                    self.logger
                        .warn(&format!("Keep-alive paused, connection unavailable: {reason}"));
                    if !self.wait_for_connection(&cancel).await {
                        break;
                    }
                    self.logger.info("Keep-alive resumed");
                }
                CycleOutcome::Cancelled => break,
            }
        }

        self.update(|s| s.phase = KeepAlivePhase::Idle);
        self.logger.info("Keep-alive stopped");
    }

    /// One arm/observe round
    async fn cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        let write = tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            result = self
                .connection
                .write_register(self.config.register, self.config.set_value) => result,
        };

        match write {
            Ok(()) => {
                let now = Utc::now();
                self.update(|s| {
                    s.last_write_time = Some(now);
                    s.phase = KeepAlivePhase::Cycling;
                });
            }
            Err(e) if is_connection_error(&e) => {
                return CycleOutcome::ConnectionLost(e.to_string());
            }
            Err(e) => {
                self.logger.warn(&format!("Life bit write rejected: {e}"));
                return self.pause_then(cancel, CycleOutcome::NotCleared).await;
            }
        }

        for _ in 0..self.config.max_polls {
            tokio::select! {
                _ = cancel.cancelled() => return CycleOutcome::Cancelled,
                _ = sleep(self.poll_interval()) => {}
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => return CycleOutcome::Cancelled,
                result = self
                    .connection
                    .read_registers(RegisterKind::Holding, self.config.register, 1) => result,
            };

            match read {
                Ok(values) if values.first() == Some(&self.config.reset_value) => {
                    return CycleOutcome::Confirmed;
                }
                Ok(_) => {}
                Err(e) if is_connection_error(&e) => {
                    return CycleOutcome::ConnectionLost(e.to_string());
                }
                Err(e) => self.logger.debug(&format!("Life bit read failed: {e}")),
            }
        }

        CycleOutcome::NotCleared
    }

    async fn pause_then(&self, cancel: &CancellationToken, outcome: CycleOutcome) -> CycleOutcome {
        tokio::select! {
            _ = cancel.cancelled() => CycleOutcome::Cancelled,
            _ = sleep(self.poll_interval()) => outcome,
        }
    }

    /// Wait until the connection is usable again; false when cancelled
    async fn wait_for_connection(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.connection.subscribe_state();
        tokio::select! {
            _ = cancel.cancelled() => false,
            ready = async {
                state
                    .wait_for(|s| matches!(s, ConnectionState::Connected))
                    .await
                    .is_ok()
            } => ready,
        }
    }
}

fn is_connection_error(error: &WallboxError) -> bool {
    error.is_connection_level()
}
