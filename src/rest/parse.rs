//! Parsers for values reported by the wallbox web API

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static PHASE_VOLTAGE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)L([123])\s*[:=]\s*([0-9]+(?:[.,][0-9]+)?)").ok());

static INET_ADDRESS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").ok());

/// Per-phase signal voltages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalVoltages {
    pub l1: Option<f64>,
    pub l2: Option<f64>,
    pub l3: Option<f64>,
}

impl SignalVoltages {
    pub fn phase(&self, selector: &str) -> Option<f64> {
        match selector {
            "l1" => self.l1,
            "l2" => self.l2,
            "l3" => self.l3,
            _ => None,
        }
    }

    const fn is_empty(&self) -> bool {
        self.l1.is_none() && self.l2.is_none() && self.l3.is_none()
    }

    fn set(&mut self, phase: &str, value: f64) {
        match phase {
            "1" | "l1" => self.l1 = Some(value),
            "2" | "l2" => self.l2 = Some(value),
            "3" | "l3" => self.l3 = Some(value),
            _ => {}
        }
    }
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim().replace(',', ".").parse().ok()
}

/// Parse signal voltages
///
/// Firmware reports either a mapping (`{"l1": 230.5, ...}`), labelled text
/// (`"L1: 230.5V, L2: 231,0V, L3: 229.8V"`, decimal comma allowed) or three
/// bare comma-separated readings (`"228 V, 227 V, 229 V"`).
pub fn parse_signal_voltages(value: &Value) -> Option<SignalVoltages> {
    let mut voltages = SignalVoltages::default();

    match value {
        Value::Object(map) => {
            for phase in ["l1", "l2", "l3"] {
                let parsed = match map.get(phase) {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => parse_decimal(s),
                    _ => None,
                };
                if let Some(v) = parsed {
                    voltages.set(phase, v);
                }
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }

            if let Some(re) = PHASE_VOLTAGE.as_ref() {
                for caps in re.captures_iter(text) {
                    if let Some(v) = parse_decimal(&caps[2]) {
                        voltages.set(&caps[1], v);
                    }
                }
            }

            if voltages.is_empty() {
                let parts: Vec<&str> = text.split(',').collect();
                if parts.len() == 3 {
                    let parsed: Option<Vec<f64>> = parts
                        .iter()
                        .map(|p| parse_decimal(&p.replace(['V', 'v'], "")))
                        .collect();
                    if let Some(values) = parsed {
                        voltages.l1 = Some(values[0]);
                        voltages.l2 = Some(values[1]);
                        voltages.l3 = Some(values[2]);
                    }
                }
            }
        }
        _ => return None,
    }

    (!voltages.is_empty()).then_some(voltages)
}

/// Primary IPv4 address from an `ip addr` style dump
///
/// Loopback and the 172.20.x access point range are skipped when any other
/// address is present.
pub fn extract_ip(interfaces: &str) -> Option<String> {
    let re = INET_ADDRESS.as_ref()?;
    let addresses: Vec<&str> = re
        .captures_iter(interfaces)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    addresses
        .iter()
        .find(|ip| !ip.starts_with("127.") && !ip.starts_with("172.20."))
        .or_else(|| addresses.first())
        .map(|ip| (*ip).to_string())
}

/// Integer from a number or numeric string
pub fn safe_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn safe_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

/// Truthiness as the web interface uses it
pub fn safe_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Some(true),
            "false" | "0" | "off" | "no" | "" => Some(false),
            _ => None,
        },
        Value::Null => None,
        _ => Some(true),
    }
}

pub fn safe_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Active error descriptions from the `/current-errors` payload
pub fn parse_errors(value: &Value) -> Vec<String> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|entry| match entry {
            Value::Object(map) => map
                .get("errorDescription")
                .filter(|v| !v.is_null() && v.as_str() != Some(""))
                .or_else(|| map.get("errorCode"))
                .and_then(safe_text)
                .unwrap_or_else(|| "Unknown".to_string()),
            other => safe_text(other).unwrap_or_else(|| other.to_string()),
        })
        .collect()
}
