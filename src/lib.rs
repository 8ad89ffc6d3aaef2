//! # Wallbox Sync - Modbus TCP and REST synchronization for EV wallboxes
//!
//! Keeps a home-automation integration in sync with a Webasto Next style
//! wallbox. One shared Modbus TCP connection carries polling, commands and
//! the life bit handshake; an optional HTTPS side-channel reads and writes
//! the settings only the web interface exposes.
//!
//! ## Architecture
//!
//! - `catalog`: register table and read plan
//! - `modbus`: transport seam, Modbus TCP client and value decoding
//! - `connection`: the single serialized device connection
//! - `keepalive`: life bit handshake that keeps the failsafe from engaging
//! - `rest`: authenticated web API session
//! - `coordinator`: poll scheduling, snapshot merging and events
//! - `gateway`: validated and clamped writes
//! - `wallbox`: runtime assembly and shutdown
//! - `config`: YAML configuration with validation
//! - `logging`: structured logging and tracing

pub mod catalog;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod keepalive;
pub mod logging;
pub mod modbus;
pub mod rest;
pub mod snapshot;
pub mod wallbox;

// Re-export commonly used types
pub use catalog::RegisterCatalog;
pub use config::Config;
pub use coordinator::{CoordinatorEvent, PollingCoordinator};
pub use error::{Result, WallboxError};
pub use gateway::{Ack, WriteGateway};
pub use snapshot::{FieldValue, Snapshot};
pub use wallbox::Wallbox;
