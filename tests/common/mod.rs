// Shared virtual wallbox for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use wallbox_sync::catalog::RegisterKind;
use wallbox_sync::config::Config;
use wallbox_sync::modbus::{
    Connector, Endpoint, ModbusTransport, TransportError, TransportResult,
};
use wallbox_sync::{Result, WallboxError};

pub const CHARGING_STATE: u16 = 1001;
pub const SESSION_COMMAND: u16 = 5006;
pub const LIFE_BIT: u16 = 6000;

/// Register contents and fault injection of the simulated device
#[derive(Debug, Default)]
pub struct DeviceState {
    pub input: HashMap<u16, u16>,
    pub holding: HashMap<u16, u16>,
    /// Inclusive ranges answered with "illegal data address"
    pub rejected: Vec<(RegisterKind, u16, u16)>,
    /// Upcoming reads that fail at the transport level
    pub io_failures: u32,
    /// Upcoming connection attempts that are refused
    pub refused_connects: u32,
    /// Clear the life bit as soon as it is written
    pub auto_clear_life_bit: bool,
    /// Answer writes with "server device failure"
    pub reject_writes: bool,
    pub writes: Vec<(u16, u16)>,
    pub reads: usize,
}

/// Protocol-compatible wallbox double
#[derive(Clone, Default)]
pub struct VirtualWallbox {
    pub state: Arc<Mutex<DeviceState>>,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl VirtualWallbox {
    pub fn new() -> Self {
        let wallbox = Self::default();
        wallbox.state.lock().unwrap().auto_clear_life_bit = true;
        wallbox
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.with(|s| s.input.insert(address, value));
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.with(|s| s.holding.get(&address).copied().unwrap_or(0))
    }

    pub fn reject(&self, kind: RegisterKind, start: u16, end: u16) {
        self.with(|s| s.rejected.push((kind, start, end)));
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.with(|s| s.io_failures = count);
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.with(|s| s.writes.clone())
    }

    pub fn writes_to(&self, address: u16) -> usize {
        self.with(|s| s.writes.iter().filter(|(a, _)| *a == address).count())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Register semantics shared by the in-memory and TCP front ends
    pub fn read(
        &self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, ExceptionCode> {
        self.with(|s| {
            s.reads += 1;
            let end = address.saturating_add(count.saturating_sub(1));
            let rejected = s
                .rejected
                .iter()
                .any(|(k, lo, hi)| *k == kind && address <= *hi && end >= *lo);
            if rejected {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let table = match kind {
                RegisterKind::Input => &s.input,
                RegisterKind::Holding => &s.holding,
            };
            Ok((0..count)
                .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(0))
                .collect())
        })
    }

    pub fn write(&self, address: u16, value: u16) -> std::result::Result<(), ExceptionCode> {
        self.with(|s| {
            if s.reject_writes {
                return Err(ExceptionCode::ServerDeviceFailure);
            }
            s.writes.push((address, value));
            match address {
                SESSION_COMMAND => {
                    let charging = u16::from(value == 1);
                    s.input.insert(CHARGING_STATE, charging);
                }
                LIFE_BIT if s.auto_clear_life_bit => {
                    s.holding.insert(LIFE_BIT, 0);
                    return Ok(());
                }
                _ => {}
            }
            s.holding.insert(address, value);
            Ok(())
        })
    }
}

struct VirtualTransport {
    device: VirtualWallbox,
}

#[async_trait]
impl ModbusTransport for VirtualTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        let io_failure = self.device.with(|s| {
            if s.io_failures > 0 {
                s.io_failures -= 1;
                true
            } else {
                false
            }
        });
        if io_failure {
            return Err(TransportError::io("connection reset by peer"));
        }
        self.device
            .read(kind, address, count)
            .map_err(|code| TransportError::exception(u8::from(code), format!("{code:?}")))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> TransportResult<()> {
        self.device
            .write(address, value)
            .map_err(|code| TransportError::exception(u8::from(code), format!("{code:?}")))
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.device.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Connector for VirtualWallbox {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ModbusTransport>> {
        let refused = self.with(|s| {
            if s.refused_connects > 0 {
                s.refused_connects -= 1;
                true
            } else {
                false
            }
        });
        if refused {
            return Err(WallboxError::network(format!(
                "Connection refused by {endpoint}"
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualTransport {
            device: self.clone(),
        }))
    }
}

struct WallboxService {
    device: VirtualWallbox,
}

impl tokio_modbus::server::Service for WallboxService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = std::future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => self
                .device
                .read(RegisterKind::Input, addr, cnt)
                .map(Response::ReadInputRegisters),
            Request::ReadHoldingRegisters(addr, cnt) => self
                .device
                .read(RegisterKind::Holding, addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister(addr, value) => self
                .device
                .write(addr, value)
                .map(|()| Response::WriteSingleRegister(addr, value)),
            _ => Err(ExceptionCode::IllegalFunction),
        };
        std::future::ready(res)
    }
}

/// Serve the device over Modbus TCP on an ephemeral local port
pub async fn serve_tcp(device: VirtualWallbox) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener);

    tokio::spawn(async move {
        let new_service = move |_addr: SocketAddr| {
            Ok::<_, std::io::Error>(Some(WallboxService {
                device: device.clone(),
            }))
        };
        let on_connected = |stream: tokio::net::TcpStream, socket_addr: SocketAddr| {
            let new_service = new_service.clone();
            async move { accept_tcp_connection(stream, socket_addr, new_service) }
        };
        let on_process_error = |err: std::io::Error| eprintln!("virtual wallbox: {err}");
        let _ = server.serve(&on_connected, on_process_error).await;
    });

    addr
}

/// Configuration with short timeouts and background loops tuned for tests
pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.modbus.host = "127.0.0.1".to_string();
    config.modbus.port = port;
    config.modbus.unit_id = 1;
    config.modbus.retry_delay_ms = 10;
    config.modbus.connect_timeout_ms = 1000;
    config.modbus.operation_timeout_ms = 1000;
    config.modbus.close_timeout_ms = 500;
    config.keepalive.enabled = false;
    config.polling.scan_interval_secs = 60;
    config
}
