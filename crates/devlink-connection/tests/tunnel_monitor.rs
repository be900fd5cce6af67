mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeDevice, FakeRunner, FakeSpawner, RecordingLogger};
use devlink_connection::adb_tcp::AdbTcp;
use devlink_connection::tunnel::{TunnelRequest, TunnelSpawner};
use devlink_connection::{DeviceHandle, ManagedDevice, TunnelMonitor, TunnelState};
use devlink_util::CommandRunner;

struct Fixture {
    runner: Arc<FakeRunner>,
    spawner: Arc<FakeSpawner>,
    device: Arc<FakeDevice>,
    monitor: TunnelMonitor,
}

fn request() -> TunnelRequest {
    TunnelRequest {
        local_port: 40123,
        remote_host: "10.0.0.5".into(),
        remote_port: 6520,
        user: "vsoc-01".into(),
        ssh_key: None,
        log_path: None,
    }
}

fn fixture(spawner: Arc<FakeSpawner>) -> Fixture {
    let runner = FakeRunner::new();
    runner.adb_always_connects();
    let adb = Arc::new(AdbTcp::new(Arc::clone(&runner) as Arc<dyn CommandRunner>));
    let device = FakeDevice::remote_placeholder("gce-device-0");
    let mut monitor = TunnelMonitor::new(
        request(),
        Arc::clone(&spawner) as Arc<dyn TunnelSpawner>,
        adb,
        Arc::clone(&device) as Arc<dyn ManagedDevice>,
    );
    monitor.start();
    Fixture {
        runner,
        spawner,
        device,
        monitor,
    }
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn tunnel_is_alive_after_first_connect() {
    let f = fixture(FakeSpawner::new());
    assert_eq!(f.monitor.serial(), "localhost:40123");
    assert_eq!(f.monitor.state(), TunnelState::NotCreated);

    advance(1).await;
    assert_eq!(f.spawner.spawned(), 1);
    assert_eq!(f.monitor.state(), TunnelState::Dead);
    assert_eq!(
        f.device.device_handle(),
        DeviceHandle::RemoteAvd {
            serial: "localhost:40123".into(),
            known_ip: None,
            user: None,
            offset: None,
        }
    );

    advance(10).await;
    assert!(f.monitor.is_tunnel_alive());
    assert_eq!(f.monitor.state(), TunnelState::Alive);
    let connect = &f.runner.commands()[0];
    assert!(connect.display().ends_with("connect localhost:40123"));
    assert!(connect
        .env
        .contains(&("ADB_TRACE".to_string(), "1".to_string())));
    assert!(f.spawner.requests()[0].log_path.is_some());
}

#[tokio::test(start_paused = true)]
async fn exited_tunnel_is_recreated() {
    let f = fixture(FakeSpawner::new());
    advance(11).await;
    assert!(f.monitor.is_tunnel_alive());

    f.spawner.exit_current();
    advance(1).await;
    assert!(!f.monitor.is_tunnel_alive());
    assert_eq!(f.spawner.spawned(), 2);
    assert!(f.runner.position("disconnect localhost:40123").is_some());

    advance(10).await;
    assert!(f.monitor.is_tunnel_alive());
}

#[tokio::test(start_paused = true)]
async fn close_request_recycles_the_tunnel() {
    let f = fixture(FakeSpawner::new());
    advance(11).await;

    f.monitor.close_connection();
    advance(1).await;
    assert!(!f.monitor.is_tunnel_alive());
    assert_eq!(f.spawner.kills(), 1);
    assert_eq!(f.spawner.spawned(), 2);
}

#[tokio::test(start_paused = true)]
async fn close_before_connect_spares_the_new_tunnel() {
    let f = fixture(FakeSpawner::new());
    advance(2).await;
    assert_eq!(f.monitor.state(), TunnelState::Dead);

    f.monitor.close_connection();
    advance(9).await;
    assert!(f.monitor.is_tunnel_alive());

    advance(1).await;
    assert!(f.monitor.is_tunnel_alive());
    assert_eq!(f.spawner.kills(), 0);
    assert_eq!(f.spawner.spawned(), 1);

    f.monitor.close_connection();
    advance(1).await;
    assert_eq!(f.spawner.kills(), 1);
    assert_eq!(f.spawner.spawned(), 2);
}

#[tokio::test(start_paused = true)]
async fn adb_reboot_delays_the_next_tunnel() {
    let f = fixture(FakeSpawner::new());
    advance(11).await;

    f.monitor.set_adb_reboot_called(true);
    f.spawner.exit_current();
    advance(30).await;
    assert_eq!(f.spawner.spawned(), 1);
    assert!(!f.monitor.is_tunnel_alive());

    advance(45).await;
    assert_eq!(f.spawner.spawned(), 2);
    assert!(f.monitor.is_tunnel_alive());
}

#[tokio::test(start_paused = true)]
async fn failed_adb_connect_recreates_the_tunnel() {
    let runner = FakeRunner::new();
    runner.on_seq(
        " connect ",
        vec![
            common::unexpected(),
            common::unexpected(),
            common::unexpected(),
            common::unexpected(),
            common::unexpected(),
            common::adb_connected(),
        ],
    );
    let spawner = FakeSpawner::new();
    let adb = Arc::new(AdbTcp::new(Arc::clone(&runner) as Arc<dyn CommandRunner>));
    let device = FakeDevice::remote_placeholder("gce-device-0");
    let mut monitor = TunnelMonitor::new(
        request(),
        Arc::clone(&spawner) as Arc<dyn TunnelSpawner>,
        adb,
        device as Arc<dyn ManagedDevice>,
    );
    monitor.start();

    // 10s first-connect wait, then 75s of adb connect backoff.
    advance(86).await;
    assert_eq!(spawner.spawned(), 2);
    assert_eq!(spawner.kills(), 1);

    advance(10).await;
    assert!(monitor.is_tunnel_alive());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_task() {
    let mut f = fixture(FakeSpawner::new());
    advance(11).await;

    f.monitor.shutdown();
    assert!(f.monitor.join(Duration::from_secs(5)).await);
    assert_eq!(f.monitor.state(), TunnelState::Dead);
    assert_eq!(f.spawner.kills(), 1);
    assert_eq!(f.spawner.spawned(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_first_connect_wait() {
    let mut f = fixture(FakeSpawner::new());
    advance(3).await;

    f.monitor.shutdown();
    assert!(f.monitor.join(Duration::from_secs(5)).await);
    assert!(!f.monitor.is_tunnel_alive());
    assert_eq!(f.spawner.kills(), 1);
    assert!(f.runner.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_ends_the_task() {
    let f = fixture(FakeSpawner::failing());
    advance(1).await;
    assert!(f.monitor.is_finished());
    assert_eq!(f.monitor.state(), TunnelState::NotCreated);
    assert!(!f.monitor.is_tunnel_alive());
}

#[tokio::test(start_paused = true)]
async fn connect_logs_are_handed_to_the_logger() {
    let mut f = fixture(FakeSpawner::new());
    advance(11).await;
    let logger = RecordingLogger::new();

    f.monitor.log_tunnel_logs(logger.as_ref());

    assert_eq!(logger.names(), vec!["adb-connect-logs".to_string()]);
    f.monitor.log_tunnel_logs(logger.as_ref());
    assert_eq!(logger.names().len(), 1);
}
