//! Modbus TCP transport for the wallbox
//!
//! The connection layer talks to the device through the [`ModbusTransport`]
//! and [`Connector`] traits so that tests can substitute an in-memory
//! wallbox. [`TcpConnector`] is the production implementation on top of
//! `tokio-modbus`. Register decoding helpers live here as well.

use crate::catalog::{RegisterBlock, RegisterDefinition, RegisterKind, ValueType};
use crate::config::ModbusConfig;
use crate::error::{Result, WallboxError};
use crate::snapshot::{FieldValue, Fragment};
use async_trait::async_trait;
use std::fmt;
use tokio::net::lookup_host;
use tokio_modbus::client::{Client as _, tcp};
use tokio_modbus::prelude::*;

/// Binary protocol address of one wallbox
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }

    pub fn from_config(config: &ModbusConfig) -> Self {
        Self::new(config.host.trim(), config.port, config.unit_id)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Failure of a single transport operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The device answered with a protocol exception; the link is healthy
    #[error("Modbus exception 0x{code:02X} ({message})")]
    Exception { code: u8, message: String },

    /// The link is unusable and must be reopened
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn exception<S: Into<String>>(code: u8, message: S) -> Self {
        Self::Exception {
            code,
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io(message.into())
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One open link to the device
#[async_trait]
pub trait ModbusTransport: Send {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>>;

    async fn write_register(&mut self, address: u16, value: u16) -> TransportResult<()>;

    async fn disconnect(&mut self) -> TransportResult<()>;
}

/// Opens transports for an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>>;
}

/// `tokio-modbus` TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>> {
        let socket_addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| WallboxError::network(format!("Cannot resolve {endpoint}: {e}")))?
            .next()
            .ok_or_else(|| WallboxError::network(format!("No address for {endpoint}")))?;

        let ctx = tcp::connect_slave(socket_addr, Slave(endpoint.unit_id))
            .await
            .map_err(|e| WallboxError::network(format!("Failed to connect to {endpoint}: {e}")))?;

        Ok(Box::new(TcpTransport { ctx }))
    }
}

struct TcpTransport {
    ctx: tokio_modbus::client::Context,
}

fn flatten<T>(result: tokio_modbus::Result<T>) -> TransportResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(code)) => {
            let message = format!("{code:?}");
            Err(TransportError::exception(u8::from(code), message))
        }
        Err(e) => Err(TransportError::io(e.to_string())),
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        let result = match kind {
            RegisterKind::Input => self.ctx.read_input_registers(address, count).await,
            RegisterKind::Holding => self.ctx.read_holding_registers(address, count).await,
        };
        flatten(result)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> TransportResult<()> {
        flatten(self.ctx.write_single_register(address, value).await)
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| TransportError::io(e.to_string()))
    }
}

/// Decode string from registers
///
/// Bytes that are not valid UTF-8 are dropped rather than failing the field.
pub fn decode_string(registers: &[u16], max_length: Option<usize>) -> String {
    let mut bytes = Vec::with_capacity(registers.len() * 2);

    for &reg in registers {
        bytes.extend_from_slice(&reg.to_be_bytes());
    }

    let decoded = String::from_utf8_lossy(&bytes).replace(char::REPLACEMENT_CHARACTER, "");

    // Padding is NUL on the Webasto, spaces on some firmware
    let string = decoded.trim_matches('\0').trim();

    match max_length {
        Some(max_len) => string.chars().take(max_len).collect(),
        None => string.to_string(),
    }
}

/// Combine a high and a low word
pub const fn decode_u32(registers: &[u16]) -> Option<u32> {
    match registers {
        [hi, lo, ..] => Some(((*hi as u32) << 16) | *lo as u32),
        _ => None,
    }
}

fn scaled(raw: u64, scale: f64) -> FieldValue {
    if (scale - 1.0).abs() < f64::EPSILON {
        FieldValue::Int(raw as i64)
    } else {
        FieldValue::Float(raw as f64 * scale)
    }
}

/// Decode the registers belonging to one definition
pub fn decode_value(def: &RegisterDefinition, registers: &[u16]) -> Result<FieldValue> {
    match def.value_type {
        ValueType::U16 => registers
            .first()
            .map(|&raw| scaled(u64::from(raw), def.scale))
            .ok_or_else(|| WallboxError::modbus(format!("No register for {}", def.key))),
        ValueType::U32 => decode_u32(registers)
            .map(|raw| scaled(u64::from(raw), def.scale))
            .ok_or_else(|| {
                WallboxError::modbus(format!("Insufficient registers for 32-bit {}", def.key))
            }),
        ValueType::Text => Ok(FieldValue::Text(decode_string(registers, None))),
        other => Err(WallboxError::modbus(format!(
            "{other:?} cannot be decoded from registers ({})",
            def.key
        ))),
    }
}

/// Decode a whole block read; keys that fail to decode are absent
pub fn decode_block(block: &RegisterBlock, registers: &[u16]) -> Fragment {
    let mut fragment = Fragment::new();
    for def in &block.definitions {
        let value = match def.binding {
            crate::catalog::Binding::Modbus { address, count, .. } => {
                let offset = usize::from(address.saturating_sub(block.start_address));
                registers
                    .get(offset..offset + usize::from(count))
                    .and_then(|slice| decode_value(def, slice).ok())
            }
            crate::catalog::Binding::Rest { .. } => None,
        };
        fragment.insert(def.key.clone(), value);
    }
    fragment
}

/// Raw register value for a scaled numeric write
pub fn encode_value(def: &RegisterDefinition, value: f64) -> Result<u16> {
    if def.value_type != ValueType::U16 {
        return Err(WallboxError::write_rejected(
            def.key.clone(),
            format!("{:?} registers cannot be written", def.value_type),
        ));
    }
    let raw = (value / def.scale).round();
    if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
        return Err(WallboxError::write_rejected(
            def.key.clone(),
            format!("Value {value} does not fit a 16-bit register"),
        ));
    }
    Ok(raw as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PlanLimits, RegisterCatalog};

    #[test]
    fn test_decode_string() {
        let registers = [0x4142, 0x4300, 0x0000]; // "ABC" NUL padded
        assert_eq!(decode_string(&registers, None), "ABC");
        assert_eq!(decode_string(&registers, Some(2)), "AB");
    }

    #[test]
    fn test_decode_string_drops_invalid_bytes() {
        assert_eq!(decode_string(&[0xFFFE], None), "");
        assert_eq!(decode_string(&[0x57FF, 0x4200], None), "WB");
    }

    #[test]
    fn test_decode_u32_high_word_first() {
        assert_eq!(decode_u32(&[0x0001, 0x0002]), Some(65538));
        assert_eq!(decode_u32(&[0x0001]), None);
    }

    #[test]
    fn test_decode_value_applies_scale() {
        let catalog = RegisterCatalog::webasto_next();
        let current = catalog.get("current_l1_a").unwrap();
        assert_eq!(decode_value(current, &[16000]).unwrap(), FieldValue::Float(16.0));

        let state = catalog.get("charging_state").unwrap();
        assert_eq!(decode_value(state, &[1]).unwrap(), FieldValue::Int(1));

        let energy = catalog.get("energy_total_kwh").unwrap();
        let FieldValue::Float(kwh) = decode_value(energy, &[0x0001, 0x86A0]).unwrap() else {
            panic!("expected float");
        };
        assert!((kwh - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_block_maps_offsets() {
        let catalog = RegisterCatalog::webasto_next();
        let plan = catalog.read_plan(PlanLimits {
            max_registers: 110,
            max_gap: 4,
        })
        .unwrap();
        let block = plan
            .iter()
            .find(|b| b.start_address == 1000 && b.kind == RegisterKind::Input)
            .unwrap();

        let mut registers = vec![0u16; usize::from(block.count)];
        registers[1] = 1; // charging_state
        registers[20] = 0x0000; // active_power_total_w hi
        registers[21] = 7400; // active_power_total_w lo
        let fragment = decode_block(block, &registers);

        assert_eq!(fragment["charging_state"], Some(FieldValue::Int(1)));
        assert_eq!(fragment["active_power_total_w"], Some(FieldValue::Int(7400)));
    }

    #[test]
    fn test_decode_block_short_response_marks_absent() {
        let catalog = RegisterCatalog::webasto_next();
        let plan = catalog.read_plan(PlanLimits {
            max_registers: 110,
            max_gap: 4,
        })
        .unwrap();
        let block = plan.iter().find(|b| b.start_address == 1000).unwrap();
        let fragment = decode_block(block, &[0, 1]);
        assert_eq!(fragment["charging_state"], Some(FieldValue::Int(1)));
        assert_eq!(fragment["energy_total_kwh"], None);
    }

    #[test]
    fn test_encode_value() {
        let catalog = RegisterCatalog::webasto_next();
        let set_current = catalog.get("set_current_a").unwrap();
        assert_eq!(encode_value(set_current, 16.0).unwrap(), 16);
        assert!(encode_value(set_current, -1.0).is_err());

        let energy = catalog.get("energy_total_kwh").unwrap();
        assert!(encode_value(energy, 1.0).is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("127.0.0.1", 502, 255);
        assert_eq!(endpoint.to_string(), "127.0.0.1:502 (unit 255)");
    }
}
