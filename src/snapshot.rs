//! Immutable merged view of all polled fields

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Decoded value of a single key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextList(Vec<String>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::TextList(v) => write!(f, "{}", v.join(", ")),
        }
    }
}

/// Partial result of one data source; `None` marks an absent key
pub type Fragment = BTreeMap<String, Option<FieldValue>>;

/// One published poll result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub values: Fragment,
}

impl Snapshot {
    pub fn new(sequence: u64, values: Fragment) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            values,
        }
    }

    /// Present value of a key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key).and_then(Option::as_ref)
    }

    /// Whether the key was polled but could not be read
    pub fn is_absent(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(None))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn absent_keys(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
    }
}
