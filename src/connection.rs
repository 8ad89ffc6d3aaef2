//! Single authoritative Modbus connection with serialized access
//!
//! Every scheduled read, keep-alive handshake and command write goes through
//! one [`ConnectionManager`]. The transport lives behind a `tokio::sync::Mutex`
//! which doubles as the exclusion token: holders suspend while waiting and no
//! two frames are ever interleaved on the wire. I/O failures drop the
//! transport so the next operation reconnects. Only connecting is retried
//! here, with exponential backoff; operation retry policy belongs to callers.

use crate::catalog::{BlockId, RegisterBlock, RegisterKind};
use crate::config::ModbusConfig;
use crate::error::{Result, WallboxError};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::{Connector, Endpoint, ModbusTransport, TransportError, decode_block};
use crate::snapshot::Fragment;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::time::{sleep, timeout};

/// Connection lifecycle as observed by other components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but recent operations failed; the next operation reconnects
    Degraded,
}

/// Why a block produced no values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFailureKind {
    /// Device rejected the request with a protocol exception
    Exception { code: u8 },
    /// Transport failed or timed out; the connection was dropped
    Io,
    /// Not attempted because the connection was lost earlier in the cycle
    Skipped,
}

#[derive(Debug, Clone)]
pub struct BlockFailure {
    pub block: BlockId,
    pub keys: Vec<String>,
    pub kind: BlockFailureKind,
    pub message: String,
}

/// Best-effort result of [`ConnectionManager::read_blocks`]
#[derive(Debug, Clone, Default)]
pub struct BlockReadOutcome {
    /// Every key of every requested block; failed keys are `None`
    pub fragment: Fragment,
    pub failures: Vec<BlockFailure>,
    pub succeeded: usize,
    /// The transport was dropped during this call
    pub connection_lost: bool,
}

impl BlockReadOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Read {
        kind: RegisterKind,
        address: u16,
        count: u16,
    },
    Write {
        address: u16,
        value: u16,
    },
}

struct ConnectionSlot {
    transport: Option<Box<dyn ModbusTransport>>,
    consecutive_failures: u32,
}

pub struct ConnectionManager {
    endpoint: Endpoint,
    config: ModbusConfig,
    connector: Arc<dyn Connector>,
    slot: Mutex<ConnectionSlot>,
    state_tx: watch::Sender<ConnectionState>,
    connections_opened: AtomicU64,
    /// Set when `close` could not take the slot; the holder closes on release
    close_pending: AtomicBool,
    logger: StructuredLogger,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, config: &ModbusConfig, connector: Arc<dyn Connector>) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("connection").with_endpoint(endpoint.to_string()),
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint,
            config: config.clone(),
            connector,
            slot: Mutex::new(ConnectionSlot {
                transport: None,
                consecutive_failures: 0,
            }),
            state_tx,
            connections_opened: AtomicU64::new(0),
            close_pending: AtomicBool::new(false),
            logger,
        }
    }

    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of transports opened over the manager's lifetime
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Open the connection unless one is already live
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.ensure_connected(&mut slot).await?;
        if self.apply_pending_close(&mut slot).await {
            return Err(WallboxError::connection_failed(
                "Connection closed while connecting",
            ));
        }
        Ok(())
    }

    async fn ensure_connected(&self, slot: &mut ConnectionSlot) -> Result<()> {
        self.apply_pending_close(slot).await;

        if slot.transport.is_some() {
            if self.state() != ConnectionState::Degraded {
                return Ok(());
            }
            self.logger.warn(&format!(
                "Recycling degraded connection after {} failed operations",
                slot.consecutive_failures
            ));
            self.invalidate(slot).await;
        }

        let attempts = self.config.connect_attempts.max(1);
        let mut backoff = self.connect_backoff();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.set_state(ConnectionState::Connecting);
            self.logger.info(&format!(
                "Connecting to Modbus server (attempt {attempt}/{attempts})"
            ));

            match timeout(
                self.config.connect_timeout(),
                self.connector.connect(&self.endpoint),
            )
            .await
            {
                Ok(Ok(transport)) => {
                    slot.transport = Some(transport);
                    slot.consecutive_failures = 0;
                    self.connections_opened.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    self.logger.info("Successfully connected to Modbus server");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "Connection timeout after {}ms",
                        self.config.connect_timeout_ms
                    );
                }
            }

            self.logger
                .warn(&format!("Connection attempt {attempt} failed: {last_error}"));
            if attempt < attempts {
                self.set_state(ConnectionState::Disconnected);
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.config.retry_delay());
                sleep(delay).await;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let error_msg = format!(
            "Could not connect to {} after {attempts} attempts: {last_error}",
            self.endpoint
        );
        self.logger.error(&error_msg);
        Err(WallboxError::connection_failed(error_msg))
    }

    fn connect_backoff(&self) -> ExponentialBackoff {
        let initial = self.config.retry_delay();
        let mut backoff = ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: initial * 8,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }

    /// Drop the transport, closing it within the close timeout
    async fn invalidate(&self, slot: &mut ConnectionSlot) {
        if let Some(mut transport) = slot.transport.take() {
            match timeout(self.config.close_timeout(), transport.disconnect()).await {
                Ok(Ok(())) => self.logger.debug("Transport closed"),
                Ok(Err(e)) => self.logger.debug(&format!("Ignoring close error: {e}")),
                Err(_) => self.logger.warn("Transport close timed out"),
            }
        }
        slot.consecutive_failures = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Finish a close requested while this caller held the slot
    async fn apply_pending_close(&self, slot: &mut ConnectionSlot) -> bool {
        if !self.close_pending.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.logger.info("Disconnecting from Modbus server after in-flight operation");
        self.invalidate(slot).await;
        true
    }

    /// Record an operation result unless a pending close takes over
    async fn settle(&self, slot: &mut ConnectionSlot, success: bool) {
        if !self.apply_pending_close(slot).await {
            self.record_outcome(slot, success);
        }
    }

    fn record_outcome(&self, slot: &mut ConnectionSlot, success: bool) {
        if success {
            slot.consecutive_failures = 0;
            if slot.transport.is_some() {
                self.set_state(ConnectionState::Connected);
            }
            return;
        }

        slot.consecutive_failures += 1;
        if slot.transport.is_some()
            && slot.consecutive_failures >= self.config.degraded_after_failures.max(1)
        {
            self.set_state(ConnectionState::Degraded);
        }
    }

    /// Run one transport operation with the operation timeout applied
    ///
    /// I/O failures and timeouts drop the connection before returning.
    async fn run_op(
        &self,
        slot: &mut ConnectionSlot,
        op: Operation,
    ) -> std::result::Result<Vec<u16>, TransportError> {
        let Some(transport) = slot.transport.as_mut() else {
            return Err(TransportError::io("Not connected"));
        };

        let request = async {
            match op {
                Operation::Read {
                    kind,
                    address,
                    count,
                } => transport.read_registers(kind, address, count).await,
                Operation::Write { address, value } => transport
                    .write_register(address, value)
                    .await
                    .map(|()| Vec::new()),
            }
        };

        let result = match timeout(self.config.operation_timeout(), request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::io(format!(
                "Operation timeout after {}ms",
                self.config.operation_timeout_ms
            ))),
        };

        if let Err(TransportError::Io(ref message)) = result {
            self.logger
                .warn(&format!("Dropping connection after I/O failure: {message}"));
            self.invalidate(slot).await;
        }
        result
    }

    /// Read every block under one hold of the exclusion token
    ///
    /// Failures are isolated per block: a rejected block only blanks its own
    /// keys. After an I/O failure the remaining blocks are skipped, since the
    /// connection is gone and reconnecting is the next cycle's job.
    pub async fn read_blocks(&self, blocks: &[RegisterBlock]) -> Result<BlockReadOutcome> {
        let mut slot = self.slot.lock().await;
        self.ensure_connected(&mut slot).await?;

        let mut outcome = BlockReadOutcome::default();

        for block in blocks {
            let keys: Vec<String> = block.keys().map(str::to_string).collect();

            if outcome.connection_lost {
                outcome.failures.push(BlockFailure {
                    block: block.id(),
                    keys: keys.clone(),
                    kind: BlockFailureKind::Skipped,
                    message: "connection lost earlier in cycle".to_string(),
                });
                outcome.fragment.extend(keys.into_iter().map(|k| (k, None)));
                continue;
            }

            let op = Operation::Read {
                kind: block.kind,
                address: block.start_address,
                count: block.count,
            };
            let result = self.run_op(&mut slot, op).await;

            match result {
                Ok(registers) => {
                    self.logger.trace(&format!(
                        "Read {} registers from {}",
                        registers.len(),
                        block.id()
                    ));
                    outcome.fragment.extend(decode_block(block, &registers));
                    outcome.succeeded += 1;
                }
                Err(e) => {
                    let kind = match &e {
                        TransportError::Exception { code, .. } => {
                            BlockFailureKind::Exception { code: *code }
                        }
                        TransportError::Io(_) => {
                            outcome.connection_lost = true;
                            BlockFailureKind::Io
                        }
                    };
                    self.logger
                        .warn(&format!("Block {} failed: {e}", block.id()));
                    outcome.failures.push(BlockFailure {
                        block: block.id(),
                        keys: keys.clone(),
                        kind,
                        message: e.to_string(),
                    });
                    outcome.fragment.extend(keys.into_iter().map(|k| (k, None)));
                }
            }
        }

        let success = outcome.succeeded > 0 || blocks.is_empty();
        self.settle(&mut slot, success).await;
        Ok(outcome)
    }

    /// Read one register range
    pub async fn read_registers(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut slot = self.slot.lock().await;
        self.ensure_connected(&mut slot).await?;

        let op = Operation::Read {
            kind,
            address,
            count,
        };
        let result = self.run_op(&mut slot, op).await;
        self.settle(&mut slot, result.is_ok()).await;

        result.map_err(|e| match e {
            TransportError::Exception { .. } => {
                WallboxError::transient_read(format!("Register {address}: {e}"))
            }
            TransportError::Io(message) => WallboxError::network(message),
        })
    }

    /// Write one holding register and confirm it through the response
    ///
    /// A protocol exception is reported as `WriteRejected`; a lost link as a
    /// network error, since the device state is then unknown.
    pub async fn write_register(&self, address: u16, value: u16) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.ensure_connected(&mut slot).await?;

        self.logger
            .debug(&format!("Writing value {value} to register {address}"));

        let result = self
            .run_op(&mut slot, Operation::Write { address, value })
            .await;
        self.settle(&mut slot, result.is_ok()).await;

        result.map(|_| ()).map_err(|e| {
            self.logger
                .error(&format!("Write of {value} to register {address} failed: {e}"));
            match e {
                TransportError::Exception { .. } => {
                    WallboxError::write_rejected(format!("register {address}"), e.to_string())
                }
                TransportError::Io(message) => WallboxError::network(message),
            }
        })
    }

    /// Close the connection; always ends `Disconnected`
    ///
    /// When an operation holds the slot past the close timeout, the state
    /// drops to `Disconnected` at once and the holder releases the transport
    /// as soon as its operation ends. The transport is never reused.
    pub async fn close(&self) {
        match timeout(self.config.close_timeout(), self.slot.lock()).await {
            Ok(mut slot) => {
                self.close_pending.store(false, Ordering::Release);
                if slot.transport.is_some() {
                    self.logger.info("Disconnecting from Modbus server");
                }
                self.invalidate(&mut slot).await;
            }
            Err(_) => {
                self.logger
                    .warn("Connection busy during close; releasing after current operation");
                self.close_pending.store(true, Ordering::Release);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }
}
