//! Validated command surface
//!
//! [`WriteGateway::write`] checks a value against the catalog entry of its
//! key, clamps numeric values into the allowed range, dispatches the write to
//! the protocol owning the key and then requests an immediate refresh.

use crate::catalog::{Binding, RegisterDefinition, ValueType};
use crate::connection::ConnectionManager;
use crate::coordinator::PollingCoordinator;
use crate::error::{Result, WallboxError};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::encode_value;
use crate::rest::RestSession;
use crate::snapshot::FieldValue;
use serde::Serialize;
use std::sync::Arc;

/// Confirmation of an applied write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub key: String,
    pub requested: FieldValue,
    /// Value actually sent to the device
    pub applied: FieldValue,
    pub clamped: bool,
    /// Sequence of the snapshot refreshed after the write, if that refresh
    /// succeeded
    pub refreshed_sequence: Option<u64>,
}

/// Outcome of validation, ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    pub applied: FieldValue,
    pub clamped: bool,
    /// Raw register value for Modbus-owned keys
    pub register_value: Option<u16>,
}

fn rejected<C: Into<String>>(def: &RegisterDefinition, cause: C) -> WallboxError {
    WallboxError::write_rejected(def.key.clone(), cause)
}

/// Validate and clamp a value for one definition
///
/// Values of the wrong type are rejected. Numeric values outside the declared
/// range are clamped; current limits are additionally capped at
/// `max_current_a`.
pub fn prepare_write(
    def: &RegisterDefinition,
    value: &FieldValue,
    max_current_a: f64,
) -> Result<PreparedWrite> {
    if !def.writable {
        return Err(rejected(def, "Key is read-only"));
    }

    let (applied, clamped) = match def.value_type {
        ValueType::Trigger => match value {
            FieldValue::Bool(true) | FieldValue::Int(1) => (value.clone(), false),
            other => {
                return Err(rejected(def, format!("Action expects 1 or true, got {other}")));
            }
        },
        ValueType::Bool => match value {
            FieldValue::Bool(b) => (FieldValue::Bool(*b), false),
            FieldValue::Int(v @ (0 | 1)) => (FieldValue::Bool(*v == 1), false),
            other => return Err(rejected(def, format!("Expected a boolean, got {other}"))),
        },
        ValueType::Text => match value {
            FieldValue::Text(s) => (FieldValue::Text(s.clone()), false),
            other => return Err(rejected(def, format!("Expected text, got {other}"))),
        },
        ValueType::TextList => return Err(rejected(def, "Lists cannot be written")),
        ValueType::U16 | ValueType::U32 | ValueType::Integer | ValueType::Float => {
            let requested = match value {
                FieldValue::Int(v) => *v as f64,
                FieldValue::Float(v) if v.is_finite() => *v,
                other => {
                    return Err(rejected(def, format!("Expected a number, got {other}")));
                }
            };

            let low = def.min.unwrap_or(f64::MIN);
            let mut high = def.max.unwrap_or(f64::MAX);
            if def.is_current_limit() {
                high = high.min(max_current_a);
            }
            let high = high.max(low);
            let bounded = requested.clamp(low, high);

            let applied = match def.value_type {
                ValueType::Float => FieldValue::Float(bounded),
                ValueType::Integer => FieldValue::Int(bounded.round() as i64),
                _ if (def.scale - 1.0).abs() < f64::EPSILON => {
                    FieldValue::Int(bounded.round() as i64)
                }
                _ => FieldValue::Float(bounded),
            };
            (applied, (bounded - requested).abs() > f64::EPSILON)
        }
    };

    let register_value = match &def.binding {
        Binding::Rest { .. } => None,
        Binding::Modbus { .. } if def.value_type == ValueType::Trigger => Some(
            def.trigger_value
                .ok_or_else(|| rejected(def, "Action has no command value"))?,
        ),
        Binding::Modbus { .. } => {
            let numeric = applied
                .as_f64()
                .ok_or_else(|| rejected(def, "Register writes need a number"))?;
            Some(encode_value(def, numeric)?)
        }
    };

    Ok(PreparedWrite {
        applied,
        clamped,
        register_value,
    })
}

pub struct WriteGateway {
    connection: Arc<ConnectionManager>,
    rest: Option<Arc<RestSession>>,
    coordinator: Arc<PollingCoordinator>,
    max_current_a: f64,
    logger: StructuredLogger,
}

impl WriteGateway {
    pub fn new(
        connection: Arc<ConnectionManager>,
        rest: Option<Arc<RestSession>>,
        coordinator: Arc<PollingCoordinator>,
        max_current_a: f64,
    ) -> Self {
        Self {
            connection,
            rest,
            coordinator,
            max_current_a,
            logger: get_logger("gateway"),
        }
    }

    /// Apply a value to a writable key
    ///
    /// A failed follow-up refresh does not fail the write; the ack then
    /// carries no refreshed sequence.
    pub async fn write(&self, key: &str, value: FieldValue) -> Result<Ack> {
        let def = self
            .coordinator
            .catalog()
            .get(key)
            .cloned()
            .ok_or_else(|| WallboxError::write_rejected(key, "Unknown key"))?;

        let prepared = prepare_write(&def, &value, self.max_current_a)?;
        if prepared.clamped {
            self.logger.warn(&format!(
                "Clamped {key} from {value} to {}",
                prepared.applied
            ));
        }

        match (&def.binding, prepared.register_value) {
            (Binding::Modbus { address, .. }, Some(raw)) => {
                self.connection
                    .write_register(*address, raw)
                    .await
                    .map_err(|e| match e {
                        WallboxError::WriteRejected { cause, .. } => rejected(&def, cause),
                        other => rejected(&def, other.to_string()),
                    })?;
            }
            (Binding::Modbus { .. }, None) => {
                return Err(rejected(&def, "No register value to write"));
            }
            (Binding::Rest { .. }, _) => {
                let rest = self
                    .rest
                    .as_ref()
                    .ok_or_else(|| rejected(&def, "Web API is not configured"))?;
                rest.write_field(&def, &prepared.applied)
                    .await
                    .map_err(|e| match e {
                        WallboxError::WriteRejected { cause, .. } => rejected(&def, cause),
                        other => rejected(&def, other.to_string()),
                    })?;
            }
        }

        self.logger
            .info(&format!("Wrote {key} = {}", prepared.applied));

        let refreshed_sequence = match self.coordinator.refresh().await {
            Ok(snapshot) => Some(snapshot.sequence),
            Err(e) => {
                self.logger
                    .warn(&format!("Refresh after writing {key} failed: {e}"));
                None
            }
        };

        Ok(Ack {
            key: key.to_string(),
            requested: value,
            applied: prepared.applied,
            clamped: prepared.clamped,
            refreshed_sequence,
        })
    }

    /// Set the charging current in amperes
    pub async fn set_current(&self, amps: f64) -> Result<Ack> {
        self.write("set_current_a", FieldValue::Float(amps)).await
    }

    pub async fn start_session(&self) -> Result<Ack> {
        self.write("start_session", FieldValue::Int(1)).await
    }

    pub async fn stop_session(&self) -> Result<Ack> {
        self.write("stop_session", FieldValue::Int(1)).await
    }
}
