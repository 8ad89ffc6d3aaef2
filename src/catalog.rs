//! Register catalog and read planning
//!
//! The catalog maps symbolic keys to protocol bindings, value types and
//! scaling. It is supplied by the caller; [`RegisterCatalog::webasto_next`]
//! provides the stock Webasto Next table. The core groups catalog entries
//! into request-sized [`RegisterBlock`]s with [`build_read_plan`].

use crate::error::{Result, WallboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Protocol limit on registers returned by one read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Value written to the session command register to start charging
pub const SESSION_COMMAND_START_VALUE: u16 = 1;

/// Value written to the session command register to stop charging
pub const SESSION_COMMAND_STOP_VALUE: u16 = 2;

/// Modbus register table a definition lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Input,
    Holding,
}

/// How the raw value of a key is typed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// One unsigned 16-bit register
    U16,
    /// Two registers, high word first
    U32,
    /// Fixed-length UTF-8 string, NUL padded
    Text,
    /// REST boolean field
    Bool,
    /// REST integer field
    Integer,
    /// REST floating point field
    Float,
    /// REST list of strings
    TextList,
    /// Write-only action carrying a fixed command value
    Trigger,
}

/// Protocol that owns a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Binding {
    Modbus {
        address: u16,
        count: u16,
        kind: RegisterKind,
    },
    Rest {
        /// Configuration field key, or action path for triggers
        ///
        /// A `field:selector` form picks one part of a composite field,
        /// e.g. `signal-voltage:l2`.
        field: String,
    },
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub key: String,
    pub binding: Binding,
    pub value_type: ValueType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub write_only: bool,
    /// Eligible for one-way removal from polling when the device rejects it
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Command value written for [`ValueType::Trigger`] keys
    #[serde(default)]
    pub trigger_value: Option<u16>,
}

const fn default_scale() -> f64 {
    1.0
}

impl RegisterDefinition {
    fn modbus(
        key: &str,
        address: u16,
        count: u16,
        kind: RegisterKind,
        value_type: ValueType,
    ) -> Self {
        Self {
            key: key.to_string(),
            binding: Binding::Modbus {
                address,
                count,
                kind,
            },
            value_type,
            scale: 1.0,
            unit: None,
            writable: false,
            write_only: false,
            optional: false,
            min: None,
            max: None,
            trigger_value: None,
        }
    }

    pub fn input_u16(key: &str, address: u16) -> Self {
        Self::modbus(key, address, 1, RegisterKind::Input, ValueType::U16)
    }

    pub fn input_u32(key: &str, address: u16) -> Self {
        Self::modbus(key, address, 2, RegisterKind::Input, ValueType::U32)
    }

    pub fn input_text(key: &str, address: u16, count: u16) -> Self {
        Self::modbus(key, address, count, RegisterKind::Input, ValueType::Text)
    }

    pub fn holding_u16(key: &str, address: u16, min: f64, max: f64) -> Self {
        let mut def = Self::modbus(key, address, 1, RegisterKind::Holding, ValueType::U16);
        def.writable = true;
        def.min = Some(min);
        def.max = Some(max);
        def
    }

    pub fn holding_trigger(key: &str, address: u16, value: u16) -> Self {
        let mut def = Self::modbus(key, address, 1, RegisterKind::Holding, ValueType::Trigger);
        def.writable = true;
        def.write_only = true;
        def.trigger_value = Some(value);
        def
    }

    pub fn rest(key: &str, field: &str, value_type: ValueType) -> Self {
        Self {
            key: key.to_string(),
            binding: Binding::Rest {
                field: field.to_string(),
            },
            value_type,
            scale: 1.0,
            unit: None,
            writable: false,
            write_only: false,
            optional: false,
            min: None,
            max: None,
            trigger_value: None,
        }
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub const fn write_only(mut self) -> Self {
        self.write_only = true;
        self
    }

    pub const fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn writable_range(mut self, min: f64, max: f64) -> Self {
        self.writable = true;
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Whether the key is a charging current subject to the hardware ceiling
    pub fn is_current_limit(&self) -> bool {
        self.writable && self.unit.as_deref() == Some("A")
    }

    /// Whether the value is produced by polling the Modbus tables
    pub const fn is_polled_register(&self) -> bool {
        matches!(self.binding, Binding::Modbus { .. }) && !self.write_only
    }

    pub const fn is_rest(&self) -> bool {
        matches!(self.binding, Binding::Rest { .. })
    }
}

/// Identifies a block across poll cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub kind: RegisterKind,
    pub start_address: u16,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        };
        write!(f, "{kind}@{}", self.start_address)
    }
}

/// A contiguous address range read with one request
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub kind: RegisterKind,
    pub start_address: u16,
    pub count: u16,
    pub definitions: Vec<RegisterDefinition>,
}

impl RegisterBlock {
    pub const fn id(&self) -> BlockId {
        BlockId {
            kind: self.kind,
            start_address: self.start_address,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.key.as_str())
    }

    /// A block is optional only when every key in it is
    pub fn is_optional(&self) -> bool {
        !self.definitions.is_empty() && self.definitions.iter().all(|d| d.optional)
    }
}

/// Limits applied when grouping definitions into blocks
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    /// Maximum registers per request
    pub max_registers: u16,
    /// Unmapped registers tolerated between two merged definitions
    pub max_gap: u16,
}

/// Group readable Modbus definitions into request-sized blocks
///
/// Definitions are grouped per register table and per optionality, sorted by
/// address and merged while the gap to the previous definition stays within
/// `max_gap` and the merged span stays within `max_registers`. A definition
/// that alone is wider than `max_registers` cannot be planned and is an error.
pub fn build_read_plan<'a, I>(definitions: I, limits: PlanLimits) -> Result<Vec<RegisterBlock>>
where
    I: IntoIterator<Item = &'a RegisterDefinition>,
{
    let mut groups: HashMap<(RegisterKind, bool), Vec<(u16, u16, &RegisterDefinition)>> =
        HashMap::new();

    for def in definitions {
        if def.write_only {
            continue;
        }
        if let Binding::Modbus {
            address,
            count,
            kind,
        } = def.binding
        {
            if count > limits.max_registers {
                return Err(WallboxError::validation(
                    def.key.clone(),
                    format!(
                        "{count} registers exceed the per-request ceiling of {}",
                        limits.max_registers
                    ),
                ));
            }
            groups
                .entry((kind, def.optional))
                .or_default()
                .push((address, count, def));
        }
    }

    let mut blocks = Vec::new();
    for (&(kind, _optional), items) in &mut groups {
        items.sort_by_key(|(address, _, _)| *address);

        let mut current: Option<RegisterBlock> = None;
        let mut current_end: u32 = 0;

        for &(address, count, def) in items.iter() {
            let reg_start = u32::from(address);
            let reg_end = reg_start + u32::from(count);

            let fits = current.as_ref().is_some_and(|block| {
                let span = reg_end.max(current_end) - u32::from(block.start_address);
                reg_start <= current_end + u32::from(limits.max_gap)
                    && span <= u32::from(limits.max_registers)
            });

            if fits {
                if let Some(block) = current.as_mut() {
                    current_end = current_end.max(reg_end);
                    block.count = (current_end - u32::from(block.start_address)) as u16;
                    block.definitions.push(def.clone());
                }
            } else {
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
                current_end = reg_end;
                current = Some(RegisterBlock {
                    kind,
                    start_address: address,
                    count,
                    definitions: vec![def.clone()],
                });
            }
        }

        if let Some(done) = current {
            blocks.push(done);
        }
    }

    blocks.sort_by_key(RegisterBlock::id);
    Ok(blocks)
}

/// Ordered set of definitions keyed by symbolic name
#[derive(Debug, Clone)]
pub struct RegisterCatalog {
    definitions: Vec<RegisterDefinition>,
    index: HashMap<String, usize>,
}

impl RegisterCatalog {
    /// Build a catalog, rejecting duplicate keys and malformed entries
    pub fn new(definitions: Vec<RegisterDefinition>) -> Result<Self> {
        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if def.key.trim().is_empty() {
                return Err(WallboxError::validation("catalog", "Empty register key"));
            }
            if index.insert(def.key.clone(), i).is_some() {
                return Err(WallboxError::validation(
                    def.key.clone(),
                    "Duplicate register key".to_string(),
                ));
            }
            if let Binding::Modbus { count, .. } = def.binding {
                let expected = match def.value_type {
                    ValueType::U16 | ValueType::Trigger => Some(1),
                    ValueType::U32 => Some(2),
                    ValueType::Text => None,
                    _ => {
                        return Err(WallboxError::validation(
                            def.key.clone(),
                            "Value type is not available over Modbus".to_string(),
                        ));
                    }
                };
                if count == 0
                    || count > MAX_REGISTERS_PER_REQUEST
                    || expected.is_some_and(|n| n != count)
                {
                    return Err(WallboxError::validation(
                        def.key.clone(),
                        format!("Register count {count} does not match {:?}", def.value_type),
                    ));
                }
            }
            if def.value_type == ValueType::Trigger
                && def.trigger_value.is_none()
                && matches!(def.binding, Binding::Modbus { .. })
            {
                return Err(WallboxError::validation(
                    def.key.clone(),
                    "Modbus trigger needs a trigger_value".to_string(),
                ));
            }
            if !(def.scale.is_finite() && def.scale > 0.0) {
                return Err(WallboxError::validation(
                    def.key.clone(),
                    "Scale must be positive".to_string(),
                ));
            }
        }
        Ok(Self { definitions, index })
    }

    pub fn get(&self, key: &str) -> Option<&RegisterDefinition> {
        self.index.get(key).map(|&i| &self.definitions[i])
    }

    pub fn definitions(&self) -> &[RegisterDefinition] {
        &self.definitions
    }

    /// Definitions read over Modbus on every poll
    pub fn polled_registers(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.definitions.iter().filter(|d| d.is_polled_register())
    }

    /// Definitions read over the web API
    pub fn rest_readable(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.definitions
            .iter()
            .filter(|d| d.is_rest() && !d.write_only)
    }

    /// Read plan for this catalog
    pub fn read_plan(&self, limits: PlanLimits) -> Result<Vec<RegisterBlock>> {
        build_read_plan(self.polled_registers(), limits)
    }

    /// Stock Webasto Next register table
    pub fn webasto_next() -> Self {
        use RegisterDefinition as D;

        let definitions = vec![
            // Identity
            D::input_text("serial_number", 100, 25).optional(),
            D::input_text("charge_point_id", 130, 50).optional(),
            D::input_text("charge_point_brand", 190, 10).optional(),
            D::input_text("charge_point_model", 210, 5).optional(),
            D::input_text("firmware_version", 230, 50).optional(),
            D::input_u32("rated_power_w", 400).unit("W").optional(),
            D::input_u16("phase_configuration", 404).optional(),
            // Status
            D::input_u16("charge_point_state", 1000),
            D::input_u16("charging_state", 1001),
            D::input_u16("equipment_state", 1002),
            D::input_u16("cable_state", 1004),
            D::input_u16("fault_code", 1006),
            // Measurements
            D::input_u16("current_l1_a", 1008).scaled(0.001).unit("A"),
            D::input_u16("current_l2_a", 1010).scaled(0.001).unit("A"),
            D::input_u16("current_l3_a", 1012).scaled(0.001).unit("A"),
            D::input_u16("voltage_l1_v", 1014).unit("V"),
            D::input_u16("voltage_l2_v", 1016).unit("V"),
            D::input_u16("voltage_l3_v", 1018).unit("V"),
            D::input_u32("active_power_total_w", 1020).unit("W"),
            D::input_u32("active_power_l1_w", 1024).unit("W"),
            D::input_u32("active_power_l2_w", 1028).unit("W"),
            D::input_u32("active_power_l3_w", 1032).unit("W"),
            D::input_u32("energy_total_kwh", 1036).scaled(0.001).unit("kWh"),
            // Limits
            D::input_u16("session_max_current_a", 1100).unit("A"),
            D::input_u16("evse_min_current_a", 1102).unit("A"),
            D::input_u16("evse_max_current_a", 1104).unit("A"),
            D::input_u16("cable_max_current_a", 1106).unit("A"),
            D::input_u16("ev_max_current_a", 1108).unit("A").optional(),
            // Session
            D::input_u16("charged_energy_wh", 1502).unit("Wh").optional(),
            D::input_u32("session_start_time", 1504),
            D::input_u32("session_duration_s", 1508).unit("s"),
            D::input_u32("session_end_time", 1512),
            // Configuration
            D::holding_u16("failsafe_current_a", 2000, 6.0, 32.0).unit("A"),
            D::holding_u16("failsafe_timeout_s", 2002, 6.0, 120.0).unit("s"),
            D::holding_u16("set_current_a", 5004, 0.0, 32.0)
                .unit("A")
                .write_only(),
            // Actions
            D::holding_trigger("start_session", 5006, SESSION_COMMAND_START_VALUE),
            D::holding_trigger("stop_session", 5006, SESSION_COMMAND_STOP_VALUE),
            D::holding_trigger("send_keepalive", 6000, 1),
            // Web API
            D::rest("comboard_sw_version", "comboard-sw-version", ValueType::Text),
            D::rest("powerboard_sw_version", "powerboard-sw-version", ValueType::Text),
            D::rest("comboard_hw_version", "comboard-hw-version", ValueType::Text),
            D::rest("powerboard_hw_version", "powerboard-hw-version", ValueType::Text),
            D::rest("mac_address_ethernet", "MAC-Address Eth0", ValueType::Text),
            D::rest("mac_address_wifi", "MAC-Address WiFi", ValueType::Text),
            D::rest("ip_address", "interfaces", ValueType::Text),
            D::rest("plug_cycles", "plug-cycles", ValueType::Integer),
            D::rest("error_counter", "error-counter", ValueType::Integer),
            D::rest(
                "total_charging_sessions",
                "total-charging-sessions",
                ValueType::Integer,
            ),
            D::rest("led_brightness", "led-brightness", ValueType::Integer)
                .writable_range(0.0, 100.0),
            D::rest("free_charging_enabled", "free-charging", ValueType::Bool)
                .writable_range(0.0, 1.0),
            D::rest("free_charging_tag_id", "free-charging-alais", ValueType::Text).writable(),
            D::rest("signal_voltage_l1", "signal-voltage:l1", ValueType::Float).unit("V"),
            D::rest("signal_voltage_l2", "signal-voltage:l2", ValueType::Float).unit("V"),
            D::rest("signal_voltage_l3", "signal-voltage:l3", ValueType::Float).unit("V"),
            D::rest("active_errors", "current-errors", ValueType::TextList),
            {
                let mut restart = D::rest(
                    "restart_system",
                    "/custom-actions/restart-system",
                    ValueType::Trigger,
                );
                restart.writable = true;
                restart.write_only = true;
                restart
            },
        ];

        // The stock table is static and always well-formed
        let index = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key.clone(), i))
            .collect();
        Self { definitions, index }
    }
}
