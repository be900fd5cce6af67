mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{adb_connected, hits, FakeDevice, FakeRunner, Harness};
use devlink_connection::adb_tcp::{AdbTcp, MAX_RETRIES};
use devlink_connection::{
    ConnectionError, ConnectionFactory, DeviceConnection, DeviceHandle, DeviceKind,
    DeviceOptions, ErrorId, HostOptions, InstanceType, ManagedDevice,
};
use devlink_telemetry::{InvocationMetrics, MetricKey};
use devlink_util::{CommandResult, CommandRunner};

fn adb(runner: &Arc<FakeRunner>) -> AdbTcp {
    AdbTcp::new(Arc::clone(runner) as Arc<dyn CommandRunner>)
}

fn remote_android(serial: &str) -> Arc<FakeDevice> {
    FakeDevice::new(
        DeviceKind::RemoteAndroid,
        DeviceHandle::Live {
            serial: serial.into(),
        },
    )
}

fn tcp_options() -> DeviceOptions {
    DeviceOptions {
        evaluate_device_connection: false,
        adb_connect_wait_time_ms: 30_000,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_bounded_retries() {
    let runner = FakeRunner::new();
    let adb = adb(&runner);

    assert!(!adb.connect("10.2.3.4", "5555").await);

    assert_eq!(runner.count_matching(" connect 10.2.3.4:5555"), MAX_RETRIES as usize);
    assert_eq!(
        runner.sleeps(),
        [5, 10, 15, 20, 25].map(Duration::from_secs).to_vec()
    );
}

#[tokio::test(start_paused = true)]
async fn refused_connection_fails_fast() {
    let runner = FakeRunner::new();
    runner.on(
        " connect ",
        CommandResult::success("failed to connect to '10.2.3.4:5555': Connection refused"),
    );
    let adb = adb(&runner);

    assert!(!adb.connect("10.2.3.4", "5555").await);

    assert_eq!(runner.commands().len(), 1);
    assert!(runner.sleeps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn first_connect_reply_must_be_confirmed() {
    let runner = FakeRunner::new();
    runner.on_seq(
        " connect ",
        vec![
            CommandResult::success("connected to 10.2.3.4:5555"),
            CommandResult::failed(1, "device offline"),
            adb_connected(),
        ],
    );
    let adb = adb(&runner);

    assert!(adb.connect("10.2.3.4", "5555").await);

    assert_eq!(runner.commands().len(), 4);
    assert_eq!(runner.sleeps(), vec![Duration::from_secs(5)]);
}

#[tokio::test(start_paused = true)]
async fn connect_log_turns_on_adb_trace() {
    let runner = FakeRunner::new();
    runner.on(
        " connect ",
        CommandResult::success("already connected to localhost:4001"),
    );
    let adb = adb(&runner);
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("adb-connect.txt");
    adb.set_connect_log(Some(log.clone()));

    assert!(adb.connect("localhost", "4001").await);

    let first = &runner.commands()[0];
    assert!(first.env.contains(&("ADB_TRACE".to_string(), "1".to_string())));
    let text = fs::read_to_string(&log).unwrap();
    assert_eq!(text.matches("SEPARATOR OF ATTEMPTS").count(), 2);

    adb.set_connect_log(None);
    assert!(!adb.disconnect("localhost", "4001").await);
    assert!(runner.commands().last().unwrap().env.is_empty());
}

#[tokio::test(start_paused = true)]
async fn wait_for_connect_reports_the_wait() {
    let runner = FakeRunner::new();
    let adb = adb(&runner);

    let err = adb
        .wait_for_connect("10.2.3.4:5555", Duration::from_secs(12))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::NotAvailable { .. }));
    assert_eq!(err.message(), "No adb connection after 12000ms.");
    assert_eq!(err.id(), ErrorId::FailedToConnectToTcpDevice);
    assert_eq!(err.serial(), Some("10.2.3.4:5555"));
}

#[tokio::test(start_paused = true)]
async fn wait_for_connect_rejects_bad_serials() {
    let runner = FakeRunner::new();
    let err = adb(&runner)
        .wait_for_connect("gce-device-0", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidSerial { .. }));
    assert!(runner.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_connects_then_waits() {
    let h = Harness::new(HostOptions::default());
    h.runner.adb_always_connects();
    let device = remote_android("10.2.3.4:5555");
    let mut conn = h.factory.create_connection(h.builder(&device, tcp_options()));
    assert_eq!(conn.kind_name(), "adb-tcp");

    conn.initialize_connection().await.unwrap();
    assert!(h.runner.commands().is_empty());

    conn.reconnect("10.2.3.4:5555").await.unwrap();
    assert_eq!(h.runner.count_matching(" connect 10.2.3.4:5555"), 3);

    let err = conn.reconnect("not-a-serial").await.unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidSerial { .. }));
}

#[tokio::test(start_paused = true)]
async fn tcp_helpers_drive_adb_directly() {
    let h = Harness::new(HostOptions::default());
    h.runner
        .adb_always_connects()
        .on(" disconnect ", CommandResult::success("disconnected 10.2.3.4:5555"));
    let device = remote_android("10.2.3.4:5555");
    let conn = h.factory.create_connection(h.builder(&device, tcp_options()));
    let tcp = conn.as_tcp().unwrap();

    assert!(tcp.adb_tcp_connect("10.2.3.4", "5555").await);
    assert!(tcp.adb_tcp_disconnect("10.2.3.4", "5555").await);

    let disconnect = h.runner.position(" disconnect 10.2.3.4:5555").unwrap();
    assert!(h.runner.position(" connect 10.2.3.4:5555").unwrap() < disconnect);
}

#[tokio::test(start_paused = true)]
async fn connections_record_into_the_invocation_metrics() {
    let metrics = InvocationMetrics::new();
    let h = Harness::new(HostOptions::default());
    let factory = ConnectionFactory::new(&HostOptions::default(), h.launcher.factory())
        .with_runner(Arc::clone(&h.runner) as Arc<dyn CommandRunner>)
        .with_metrics(metrics.clone());
    let device = remote_android("10.2.3.4:5555");
    let conn = factory.create_connection(h.builder(&device, tcp_options()));
    let cause = ConnectionError::not_available(
        "adb went away",
        "10.2.3.4:5555",
        ErrorId::DeviceUnavailable,
    );

    conn.recover_virtual_device(device.as_ref(), None, cause)
        .await
        .unwrap();

    assert_eq!(metrics.count(MetricKey::DeviceRecoveredFromDeviceReset), 1);
    assert!(!h
        .factory
        .metrics()
        .contains(MetricKey::DeviceRecoveredFromDeviceReset));
}

#[tokio::test(start_paused = true)]
async fn reconnect_waits_out_an_unreachable_device() {
    let h = Harness::new(HostOptions::default());
    let device = remote_android("10.2.3.4:5555");
    let mut conn = h.factory.create_connection(h.builder(&device, tcp_options()));

    let err = conn.reconnect_for_recovery("10.2.3.4:5555").await.unwrap_err();

    assert_eq!(err.message(), "No adb connection after 30000ms.");
}

#[tokio::test(start_paused = true)]
async fn pre_existing_nested_device_is_attached_and_released() {
    let h = Harness::new(HostOptions::default());
    h.runner.adb_always_connects();
    let original = DeviceHandle::RemoteAvd {
        serial: "gce-device-3".into(),
        known_ip: Some("10.1.1.1".into()),
        user: Some("vsoc-01".into()),
        offset: Some(2),
    };
    let device = FakeDevice::new(DeviceKind::Native, original.clone());
    let options = DeviceOptions {
        instance_type: InstanceType::RemoteNestedAvd,
        ..Default::default()
    };
    let mut conn = h.factory.create_connection(h.builder(&device, options));
    assert_eq!(conn.kind_name(), "adb-tcp");

    conn.initialize_connection().await.unwrap();

    let disconnect = h.runner.position("disconnect 10.1.1.1:5557").unwrap();
    let connect = h.runner.position(" connect 10.1.1.1:5557").unwrap();
    assert!(disconnect < connect);
    assert_eq!(
        device.device_handle(),
        DeviceHandle::RemoteAvd {
            serial: "10.1.1.1:5557".into(),
            known_ip: Some("10.1.1.1".into()),
            user: None,
            offset: None,
        }
    );

    conn.tear_down_connection().await;
    assert_eq!(device.device_handle(), original);
}

#[tokio::test(start_paused = true)]
async fn pre_existing_device_without_ip_is_left_alone() {
    let h = Harness::new(HostOptions::default());
    let device = FakeDevice::new(
        DeviceKind::Native,
        DeviceHandle::RemoteAvd {
            serial: "10.9.9.9:6520".into(),
            known_ip: None,
            user: None,
            offset: None,
        },
    );
    let options = DeviceOptions {
        instance_type: InstanceType::RemoteNestedAvd,
        ..Default::default()
    };
    let mut conn = h
        .factory
        .create_connection(h.builder(&device, options).mark_pre_existing());
    assert_eq!(conn.kind_name(), "adb-tcp");

    conn.initialize_connection().await.unwrap();
    assert!(h.runner.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn recovery_without_snapshot_resets_the_device() {
    let h = Harness::new(HostOptions::default());
    let device = remote_android("10.2.3.4:5555");
    let conn = h.factory.create_connection(h.builder(&device, tcp_options()));
    let cause = ConnectionError::not_available(
        "adb went away",
        "10.2.3.4:5555",
        ErrorId::DeviceUnavailable,
    );

    conn.recover_virtual_device(device.as_ref(), None, cause.clone())
        .await
        .unwrap();
    conn.recover_virtual_device(device.as_ref(), Some(""), cause.clone())
        .await
        .unwrap();

    assert_eq!(hits(&device.resets), 2);
    assert_eq!(
        h.factory
            .metrics()
            .count(MetricKey::DeviceRecoveredFromDeviceReset),
        2
    );

    device.reset_ok.store(false, Ordering::SeqCst);
    let err = conn
        .recover_virtual_device(device.as_ref(), None, cause)
        .await
        .unwrap_err();
    assert_eq!(
        err.message(),
        "Failed to recover device: 10.2.3.4:5555. adb went away"
    );
    assert_eq!(err.id(), ErrorId::DeviceFailedToReset);
    assert_eq!(
        h.factory
            .metrics()
            .count(MetricKey::DeviceRecoveredFromDeviceReset),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn snapshot_recovery_needs_a_feature_client() {
    let h = Harness::new(HostOptions::default());
    let device = remote_android("10.2.3.4:5555");
    let conn = h.factory.create_connection(h.builder(&device, tcp_options()));
    let cause = ConnectionError::unresponsive("stuck", "10.2.3.4:5555", ErrorId::DeviceUnresponsive);

    let err = conn
        .recover_virtual_device(device.as_ref(), Some("snap-1"), cause.clone())
        .await
        .unwrap_err();
    assert_eq!(err, cause);
    assert_eq!(hits(&device.resets), 0);

    conn.snapshot_device(device.as_ref(), "").await.unwrap();
    let err = conn
        .snapshot_device(device.as_ref(), "snap-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Runtime { .. }));
}

#[tokio::test(start_paused = true)]
async fn tear_down_removes_the_connect_log() {
    let h = Harness::new(HostOptions::default());
    let device = remote_android("10.2.3.4:5555");
    let mut conn = h.factory.create_connection(h.builder(&device, tcp_options()));
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("adb.txt");
    fs::write(&log, "trace").unwrap();
    conn.as_tcp().unwrap().adb().set_connect_log(Some(log.clone()));

    conn.tear_down_connection().await;

    assert!(!log.exists());
    assert!(conn.as_tcp().unwrap().adb().connect_log().is_none());
    assert_eq!(
        device.device_handle(),
        DeviceHandle::Live {
            serial: "10.2.3.4:5555".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn direct_connection_does_nothing() {
    let h = Harness::new(HostOptions::default());
    let device = FakeDevice::new(
        DeviceKind::Native,
        DeviceHandle::Live {
            serial: "emulator-5554".into(),
        },
    );
    let mut conn = h
        .factory
        .create_connection(h.builder(&device, DeviceOptions::default()));
    assert_eq!(conn.kind_name(), "direct");
    assert!(conn.as_tcp().is_none());

    conn.initialize_connection().await.unwrap();
    conn.reconnect("emulator-5554").await.unwrap();
    conn.reconnect_for_recovery("emulator-5554").await.unwrap();
    conn.notify_adb_reboot_called();
    conn.snapshot_device(device.as_ref(), "snap-1").await.unwrap();
    let cause = ConnectionError::runtime("boom", ErrorId::Undetermined);
    let err = conn
        .recover_virtual_device(device.as_ref(), None, cause.clone())
        .await
        .unwrap_err();
    assert_eq!(err, cause);
    conn.tear_down_connection().await;

    assert!(h.runner.commands().is_empty());
    assert_eq!(hits(&device.resets), 0);
}

#[tokio::test(start_paused = true)]
async fn inop_connection_ignores_the_device_kind() {
    let h = Harness::new(HostOptions::default());
    let device = FakeDevice::remote_placeholder("gce-device-0");
    let mut conn = h.factory.create_inop_connection(h.builder(
        &device,
        DeviceOptions {
            evaluate_device_connection: false,
            ..Default::default()
        },
    ));
    assert_eq!(conn.kind_name(), "direct");
    conn.initialize_connection().await.unwrap();
    assert_eq!(hits(&h.launcher.launches), 0);
    assert_eq!(conn.base().initial_serial(), "gce-device-0");
    assert_eq!(conn.base().device_name(), "gce-device-0");
}
