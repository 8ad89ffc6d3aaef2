mod common;

use async_trait::async_trait;
use common::VirtualWallbox;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wallbox_sync::WallboxError;
use wallbox_sync::catalog::{PlanLimits, RegisterDefinition, RegisterKind, build_read_plan};
use wallbox_sync::config::ModbusConfig;
use wallbox_sync::connection::{BlockFailureKind, ConnectionManager, ConnectionState};
use wallbox_sync::modbus::{Connector, Endpoint, ModbusTransport, TransportResult};
use wallbox_sync::snapshot::FieldValue;

fn manager(device: &VirtualWallbox, config: &ModbusConfig) -> ConnectionManager {
    ConnectionManager::new(
        Endpoint::from_config(config),
        config,
        Arc::new(device.clone()),
    )
}

fn fast_config() -> ModbusConfig {
    common::test_config(502).modbus
}

#[tokio::test]
async fn connect_twice_opens_one_socket() {
    let device = VirtualWallbox::new();
    let conn = manager(&device, &fast_config());

    conn.connect().await.unwrap();
    conn.connect().await.unwrap();

    assert_eq!(device.connects(), 1);
    assert_eq!(conn.connections_opened(), 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn connect_gives_up_after_bounded_attempts() {
    let device = VirtualWallbox::new();
    device.with(|s| s.refused_connects = 5);
    let conn = manager(&device, &fast_config());

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, WallboxError::ConnectionFailed { .. }));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    // Three attempts consumed, two refusals left
    assert_eq!(device.with(|s| s.refused_connects), 2);
}

#[tokio::test]
async fn connect_succeeds_on_a_later_attempt() {
    let device = VirtualWallbox::new();
    device.with(|s| s.refused_connects = 2);
    let conn = manager(&device, &fast_config());

    conn.connect().await.unwrap();
    assert_eq!(device.connects(), 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn io_failure_drops_connection_and_next_call_reconnects() {
    let device = VirtualWallbox::new();
    device.set_input(1001, 3);
    let conn = manager(&device, &fast_config());
    conn.connect().await.unwrap();

    device.fail_next_reads(1);
    let err = conn
        .read_registers(RegisterKind::Input, 1001, 1)
        .await
        .unwrap_err();
    assert!(err.is_connection_level());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(device.disconnects(), 1);

    let values = conn
        .read_registers(RegisterKind::Input, 1001, 1)
        .await
        .unwrap();
    assert_eq!(values, vec![3]);
    assert_eq!(device.connects(), 2);
}

#[tokio::test]
async fn protocol_exception_keeps_connection() {
    let device = VirtualWallbox::new();
    device.reject(RegisterKind::Input, 100, 120);
    let conn = manager(&device, &fast_config());

    let err = conn
        .read_registers(RegisterKind::Input, 100, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, WallboxError::TransientRead { .. }));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(device.connects(), 1);
}

#[tokio::test]
async fn repeated_failures_degrade_then_recycle() {
    let device = VirtualWallbox::new();
    device.reject(RegisterKind::Input, 100, 100);
    let mut config = fast_config();
    config.degraded_after_failures = 2;
    let conn = manager(&device, &config);

    for _ in 0..2 {
        let _ = conn.read_registers(RegisterKind::Input, 100, 1).await;
    }
    assert_eq!(conn.state(), ConnectionState::Degraded);

    conn.read_registers(RegisterKind::Input, 200, 1).await.unwrap();
    assert_eq!(device.connects(), 2);
    assert_eq!(device.disconnects(), 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn rejected_write_surfaces_write_rejected() {
    let device = VirtualWallbox::new();
    device.with(|s| s.reject_writes = true);
    let conn = manager(&device, &fast_config());

    let err = conn.write_register(5004, 10).await.unwrap_err();
    assert!(matches!(err, WallboxError::WriteRejected { .. }));
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn close_is_idempotent() {
    let device = VirtualWallbox::new();
    let conn = manager(&device, &fast_config());
    conn.connect().await.unwrap();

    conn.close().await;
    conn.close().await;

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(device.disconnects(), 1);
}

#[tokio::test]
async fn read_blocks_isolates_failed_block() {
    let device = VirtualWallbox::new();
    device.set_input(100, 7);
    device.set_input(200, 1);
    device.reject(RegisterKind::Input, 200, 202);

    let defs = [
        RegisterDefinition::input_u16("z", 100),
        RegisterDefinition::input_u16("x", 200),
        RegisterDefinition::input_u32("y", 201),
    ];
    let blocks = build_read_plan(
        defs.iter(),
        PlanLimits {
            max_registers: 110,
            max_gap: 4,
        },
    )
    .unwrap();
    assert_eq!(blocks.len(), 2);

    let conn = manager(&device, &fast_config());
    let outcome = conn.read_blocks(&blocks).await.unwrap();

    assert_eq!(outcome.succeeded, 1);
    assert!(!outcome.connection_lost);
    assert_eq!(outcome.fragment["z"], Some(FieldValue::Int(7)));
    assert_eq!(outcome.fragment["x"], None);
    assert_eq!(outcome.fragment["y"], None);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(
        outcome.failures[0].kind,
        BlockFailureKind::Exception { code: 2 }
    );
}

#[tokio::test]
async fn read_blocks_skips_remaining_blocks_after_io_failure() {
    let device = VirtualWallbox::new();
    let defs = [
        RegisterDefinition::input_u16("a", 100),
        RegisterDefinition::input_u16("b", 300),
    ];
    let blocks = build_read_plan(
        defs.iter(),
        PlanLimits {
            max_registers: 110,
            max_gap: 4,
        },
    )
    .unwrap();

    let conn = manager(&device, &fast_config());
    conn.connect().await.unwrap();
    device.fail_next_reads(1);

    let outcome = conn.read_blocks(&blocks).await.unwrap();
    assert!(outcome.connection_lost);
    assert_eq!(outcome.succeeded, 0);
    assert_eq!(outcome.failures[0].kind, BlockFailureKind::Io);
    assert_eq!(outcome.failures[1].kind, BlockFailureKind::Skipped);
    assert_eq!(device.with(|s| s.reads), 0);
}

/// Link whose reads take half a second, counting opened and closed sockets
#[derive(Clone, Default)]
struct SlowLink {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

struct SlowTransport {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for SlowLink {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
    ) -> wallbox_sync::Result<Box<dyn ModbusTransport>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SlowTransport {
            closed: Arc::clone(&self.closed),
        }))
    }
}

#[async_trait]
impl ModbusTransport for SlowTransport {
    async fn read_registers(
        &mut self,
        _kind: RegisterKind,
        _address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(vec![0; usize::from(count)])
    }

    async fn write_register(&mut self, _address: u16, _value: u16) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn close_while_busy_releases_socket_after_the_operation() {
    let link = SlowLink::default();
    let mut config = fast_config();
    config.close_timeout_ms = 100;
    config.operation_timeout_ms = 2000;
    let conn = Arc::new(ConnectionManager::new(
        Endpoint::from_config(&config),
        &config,
        Arc::new(link.clone()),
    ));
    conn.connect().await.unwrap();

    let reader = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read_registers(RegisterKind::Input, 1000, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    reader.await.unwrap().unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(link.closed.load(Ordering::SeqCst), 1);

    conn.connect().await.unwrap();
    assert_eq!(link.opened.load(Ordering::SeqCst), 2);
    assert_eq!(conn.connections_opened(), 2);
}
