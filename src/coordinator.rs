//! Poll scheduling, merging and change notification
//!
//! [`PollingCoordinator::refresh`] reads every active register block and,
//! when configured, the web API in parallel, merges both fragments into one
//! [`Snapshot`] and publishes it. Refreshes are serialized by an internal
//! cycle lock, so sequence numbers are handed out in publication order.

use crate::catalog::{BlockId, RegisterBlock, RegisterCatalog};
use crate::config::{ModbusConfig, PollingConfig};
use crate::connection::{BlockFailureKind, BlockReadOutcome, ConnectionManager, ConnectionState};
use crate::error::{Result, WallboxError};
use crate::logging::{StructuredLogger, get_logger};
use crate::rest::RestSession;
use crate::snapshot::{FieldValue, Fragment, Snapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Key whose transitions drive the charging events
pub const CHARGING_STATE_KEY: &str = "charging_state";

const CHARGING_ACTIVE: i64 = 1;
const EVENT_CAPACITY: usize = 64;

/// Notification published to subscribers
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A new snapshot was published
    Updated(Arc<Snapshot>),
    /// A cycle produced no snapshot; the previous one stays current
    UpdateFailed { reason: String },
    ConnectionLost { reason: String },
    ConnectionRestored,
    ChargingStarted,
    ChargingStopped,
    /// An optional block was removed from polling for good
    BlockDisabled { block: BlockId, keys: Vec<String> },
    /// Consecutive failures reached the notification threshold
    PersistentFailure { consecutive_failures: u32, reason: String },
    /// First success after a persistent failure was announced
    FailureCleared,
}

/// Health summary for diagnostics dumps
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub connection_state: ConnectionState,
    pub last_sequence: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub active_blocks: Vec<BlockId>,
    pub disabled_blocks: Vec<BlockId>,
    pub rest_enabled: bool,
}

struct CycleState {
    sequence: u64,
    active_blocks: Vec<RegisterBlock>,
    disabled_blocks: BTreeSet<BlockId>,
    disabled_keys: Vec<String>,
    block_failures: HashMap<BlockId, u32>,
    consecutive_failures: u32,
    failure_notified: bool,
    connection_lost: bool,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct PollingCoordinator {
    connection: Arc<ConnectionManager>,
    rest: Option<Arc<RestSession>>,
    catalog: Arc<RegisterCatalog>,
    polling: PollingConfig,
    cycle: Mutex<CycleState>,
    latest_tx: watch::Sender<Option<Arc<Snapshot>>>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    diagnostics_tx: watch::Sender<Diagnostics>,
    logger: StructuredLogger,
}

impl PollingCoordinator {
    /// Build a coordinator over the catalog's read plan
    ///
    /// Fails when a catalog entry does not fit the configured request ceiling.
    pub fn new(
        connection: Arc<ConnectionManager>,
        rest: Option<Arc<RestSession>>,
        catalog: Arc<RegisterCatalog>,
        modbus: &ModbusConfig,
        polling: &PollingConfig,
    ) -> Result<Self> {
        let active_blocks = catalog.read_plan(modbus.plan_limits())?;
        let logger = get_logger("coordinator");
        logger.info(&format!(
            "Polling {} register blocks every {}s (REST {})",
            active_blocks.len(),
            polling.interval().as_secs(),
            if rest.is_some() { "enabled" } else { "disabled" }
        ));

        let (latest_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (diagnostics_tx, _) = watch::channel(Diagnostics {
            connection_state: connection.state(),
            last_sequence: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            active_blocks: active_blocks.iter().map(RegisterBlock::id).collect(),
            disabled_blocks: Vec::new(),
            rest_enabled: rest.is_some(),
        });

        Ok(Self {
            connection,
            rest,
            catalog,
            polling: polling.clone(),
            cycle: Mutex::new(CycleState {
                sequence: 0,
                active_blocks,
                disabled_blocks: BTreeSet::new(),
                disabled_keys: Vec::new(),
                block_failures: HashMap::new(),
                consecutive_failures: 0,
                failure_notified: false,
                connection_lost: false,
                last_success: None,
                last_failure: None,
                last_error: None,
            }),
            latest_tx,
            events_tx,
            diagnostics_tx,
            logger,
        })
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    /// Last published snapshot
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.latest_tx.borrow().clone()
    }

    /// Receiver that always holds the last published snapshot
    pub fn watch_latest(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.latest_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut diagnostics = self.diagnostics_tx.borrow().clone();
        diagnostics.connection_state = self.connection.state();
        diagnostics
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is not an error
        let _ = self.events_tx.send(event);
    }

    /// Run one poll cycle and publish its snapshot
    ///
    /// Returns `UpdateFailed` when nothing could be read; the previous
    /// snapshot then stays current.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let mut cycle = self.cycle.lock().await;
        let blocks = cycle.active_blocks.clone();

        let rest_read = async {
            match &self.rest {
                Some(rest) => Some(rest.fetch_fragment(&self.catalog).await),
                None => None,
            }
        };
        let (modbus, rest) = tokio::join!(self.connection.read_blocks(&blocks), rest_read);

        let outcome = match modbus {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail_cycle(&mut cycle, &e.to_string())),
        };

        if outcome.connection_lost {
            let reason = outcome
                .failures
                .iter()
                .find(|f| f.kind == BlockFailureKind::Io)
                .map_or_else(|| "connection lost".to_string(), |f| f.message.clone());
            if outcome.succeeded == 0 && !blocks.is_empty() {
                return Err(self.fail_cycle(&mut cycle, &reason));
            }
            self.mark_connection_lost(&mut cycle, &reason);
        } else if cycle.connection_lost {
            cycle.connection_lost = false;
            self.logger.info("Connection restored");
            self.emit(CoordinatorEvent::ConnectionRestored);
        }

        self.apply_block_degradation(&mut cycle, &outcome);

        let mut values = outcome.fragment;
        for key in &cycle.disabled_keys {
            values.entry(key.clone()).or_insert(None);
        }
        self.merge_rest(&mut values, rest);

        let absent: Vec<&str> = values
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
            .collect();
        if !absent.is_empty() {
            self.logger.debug(&format!(
                "Snapshot with {} absent fields: {}",
                absent.len(),
                absent.join(",")
            ));
        }

        cycle.sequence += 1;
        let snapshot = Arc::new(Snapshot::new(cycle.sequence, values));
        self.detect_charging_transition(&snapshot);

        if cycle.failure_notified {
            self.logger.info("Polling recovered");
            self.emit(CoordinatorEvent::FailureCleared);
        }
        cycle.consecutive_failures = 0;
        cycle.failure_notified = false;
        cycle.last_success = Some(snapshot.timestamp);

        self.latest_tx.send_replace(Some(Arc::clone(&snapshot)));
        self.publish_diagnostics(&cycle);
        self.emit(CoordinatorEvent::Updated(Arc::clone(&snapshot)));

        self.logger.trace(&format!("Published snapshot {}", snapshot.sequence));
        Ok(snapshot)
    }

    fn mark_connection_lost(&self, cycle: &mut CycleState, reason: &str) {
        if !cycle.connection_lost {
            cycle.connection_lost = true;
            self.logger.warn(&format!("Connection lost: {reason}"));
            self.emit(CoordinatorEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    fn fail_cycle(&self, cycle: &mut CycleState, reason: &str) -> WallboxError {
        self.mark_connection_lost(cycle, reason);

        cycle.consecutive_failures += 1;
        cycle.last_failure = Some(Utc::now());
        cycle.last_error = Some(reason.to_string());

        self.logger.warn(&format!(
            "Update failed ({} consecutive): {reason}",
            cycle.consecutive_failures
        ));
        self.emit(CoordinatorEvent::UpdateFailed {
            reason: reason.to_string(),
        });

        let threshold = self.polling.failure_notification_threshold.max(1);
        if !cycle.failure_notified && cycle.consecutive_failures >= threshold {
            cycle.failure_notified = true;
            self.logger.error(&format!(
                "Wallbox unreachable for {} consecutive cycles: {reason}",
                cycle.consecutive_failures
            ));
            self.emit(CoordinatorEvent::PersistentFailure {
                consecutive_failures: cycle.consecutive_failures,
                reason: reason.to_string(),
            });
        }

        self.publish_diagnostics(cycle);
        WallboxError::update_failed(reason)
    }

    /// Drop optional blocks the device keeps rejecting
    fn apply_block_degradation(&self, cycle: &mut CycleState, outcome: &BlockReadOutcome) {
        let failed: HashMap<BlockId, &BlockFailureKind> =
            outcome.failures.iter().map(|f| (f.block, &f.kind)).collect();

        let threshold = self.polling.optional_block_failure_threshold.max(1);
        let mut to_disable = Vec::new();

        for block in &cycle.active_blocks {
            let id = block.id();
            match failed.get(&id) {
                None => {
                    cycle.block_failures.remove(&id);
                }
                Some(BlockFailureKind::Exception { .. }) if block.is_optional() => {
                    let count = cycle.block_failures.entry(id).or_insert(0);
                    *count += 1;
                    if *count >= threshold {
                        to_disable.push(id);
                    }
                }
                Some(_) => {}
            }
        }

        for id in to_disable {
            let Some(pos) = cycle.active_blocks.iter().position(|b| b.id() == id) else {
                continue;
            };
            let block = cycle.active_blocks.remove(pos);
            let keys: Vec<String> = block.keys().map(str::to_string).collect();
            cycle.block_failures.remove(&id);
            cycle.disabled_blocks.insert(id);
            cycle.disabled_keys.extend(keys.iter().cloned());

            self.logger.warn(&format!(
                "Disabling optional block {id} ({}); the device does not support it",
                keys.join(",")
            ));
            self.emit(CoordinatorEvent::BlockDisabled { block: id, keys });
        }
    }

    fn merge_rest(&self, values: &mut Fragment, rest: Option<Result<Fragment>>) {
        let fetched = match rest {
            Some(Ok(fragment)) => Some(fragment),
            Some(Err(e)) => {
                self.logger.warn(&format!("REST update failed: {e}"));
                None
            }
            None => None,
        };

        match fetched {
            Some(fragment) => values.extend(fragment),
            None => {
                for def in self.catalog.rest_readable() {
                    values.insert(def.key.clone(), None);
                }
            }
        }
    }

    fn detect_charging_transition(&self, snapshot: &Snapshot) {
        let previous = self
            .latest_tx
            .borrow()
            .as_ref()
            .and_then(|s| s.get(CHARGING_STATE_KEY).and_then(FieldValue::as_i64));
        let current = snapshot
            .get(CHARGING_STATE_KEY)
            .and_then(FieldValue::as_i64);

        match (previous, current) {
            (Some(prev), Some(CHARGING_ACTIVE)) if prev != CHARGING_ACTIVE => {
                self.logger.info("Charging started");
                self.emit(CoordinatorEvent::ChargingStarted);
            }
            (Some(CHARGING_ACTIVE), Some(cur)) if cur != CHARGING_ACTIVE => {
                self.logger.info("Charging stopped");
                self.emit(CoordinatorEvent::ChargingStopped);
            }
            _ => {}
        }
    }

    fn publish_diagnostics(&self, cycle: &CycleState) {
        self.diagnostics_tx.send_replace(Diagnostics {
            connection_state: self.connection.state(),
            last_sequence: cycle.sequence,
            consecutive_failures: cycle.consecutive_failures,
            last_success: cycle.last_success,
            last_failure: cycle.last_failure,
            last_error: cycle.last_error.clone(),
            active_blocks: cycle.active_blocks.iter().map(RegisterBlock::id).collect(),
            disabled_blocks: cycle.disabled_blocks.iter().copied().collect(),
            rest_enabled: self.rest.is_some(),
        });
    }

    /// Spawn the scheduled poll loop
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Refresh on the configured interval until cancelled
    ///
    /// The first scheduled refresh happens one interval after the call.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.polling.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.refresh() => {
                    if let Err(e) = result {
                        self.logger.debug(&format!("Scheduled refresh failed: {e}"));
                    }
                }
            }
        }

        self.logger.info("Polling stopped");
    }
}
