use std::sync::Arc;

use async_trait::async_trait;
use devlink_telemetry::InvocationMetrics;
use devlink_util::CommandRunner;

use crate::config::DeviceOptions;
use crate::device::{DeviceHandle, ManagedDevice};
use crate::error::{ConnectionError, ConnectionResult};
use crate::launcher::{BuildInfo, LaunchAttributes};
use crate::logger::TestLogger;
use crate::snapshot::SnapshotHandler;
use crate::ssh::SshConnection;
use crate::tcp::TcpConnection;

/// Lifecycle hooks of a device channel. Every hook defaults to doing nothing so a
/// connection only implements what differs.
#[async_trait]
pub trait DeviceConnection: Send {
    async fn initialize_connection(&mut self) -> ConnectionResult<()> {
        Ok(())
    }

    async fn reconnect(&mut self, _serial: &str) -> ConnectionResult<()> {
        Ok(())
    }

    /// Reconnect issued by the generic device recovery path.
    async fn reconnect_for_recovery(&mut self, serial: &str) -> ConnectionResult<()> {
        self.reconnect(serial).await
    }

    /// Advisory: an adb reboot is about to drop the transport.
    fn notify_adb_reboot_called(&self) {}

    /// Never fails; problems are logged.
    async fn tear_down_connection(&mut self) {}

    /// Tries to bring a device back after `error`. Returns `Ok` once recovered,
    /// otherwise an error (by default `error` itself).
    async fn recover_virtual_device(
        &self,
        _device: &dyn ManagedDevice,
        _snapshot_id: Option<&str>,
        error: ConnectionError,
    ) -> ConnectionResult<()> {
        Err(error)
    }

    async fn snapshot_device(
        &self,
        _device: &dyn ManagedDevice,
        _snapshot_id: &str,
    ) -> ConnectionResult<()> {
        Ok(())
    }
}

/// What a connection captured about its device when it was built.
pub struct ConnectionBase {
    runner: Arc<dyn CommandRunner>,
    device: Arc<dyn ManagedDevice>,
    build_info: BuildInfo,
    attributes: LaunchAttributes,
    logger: Arc<dyn TestLogger>,
    options: DeviceOptions,
    metrics: InvocationMetrics,
    snapshots: Option<SnapshotHandler>,
    device_name: String,
    initial_serial: String,
    initial_ip: Option<String>,
    initial_user: Option<String>,
    initial_offset: Option<u32>,
    temporary_holder: bool,
    pre_existing: bool,
}

pub(crate) struct BaseParts {
    pub runner: Arc<dyn CommandRunner>,
    pub device: Arc<dyn ManagedDevice>,
    pub build_info: BuildInfo,
    pub attributes: LaunchAttributes,
    pub logger: Arc<dyn TestLogger>,
    pub options: DeviceOptions,
    pub metrics: InvocationMetrics,
    pub snapshots: Option<SnapshotHandler>,
    pub device_name: String,
    pub pre_existing: bool,
}

impl ConnectionBase {
    pub(crate) fn new(parts: BaseParts) -> Self {
        let handle = parts.device.device_handle();
        Self {
            initial_serial: parts.device.serial(),
            initial_ip: handle.known_ip().map(str::to_string),
            initial_user: handle.known_user().map(str::to_string),
            initial_offset: handle.device_offset(),
            temporary_holder: handle.is_temporary(),
            runner: parts.runner,
            device: parts.device,
            build_info: parts.build_info,
            attributes: parts.attributes,
            logger: parts.logger,
            options: parts.options,
            metrics: parts.metrics,
            snapshots: parts.snapshots,
            device_name: parts.device_name,
            pre_existing: parts.pre_existing,
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn device(&self) -> &Arc<dyn ManagedDevice> {
        &self.device
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.build_info
    }

    pub fn attributes(&self) -> &LaunchAttributes {
        &self.attributes
    }

    pub fn logger(&self) -> &dyn TestLogger {
        self.logger.as_ref()
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn metrics(&self) -> &InvocationMetrics {
        &self.metrics
    }

    pub fn snapshots(&self) -> Option<&SnapshotHandler> {
        self.snapshots.as_ref()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn initial_serial(&self) -> &str {
        &self.initial_serial
    }

    pub fn initial_ip(&self) -> Option<&str> {
        self.initial_ip.as_deref()
    }

    pub fn initial_user(&self) -> Option<&str> {
        self.initial_user.as_deref()
    }

    pub fn initial_offset(&self) -> Option<u32> {
        self.initial_offset
    }

    pub fn was_temporary_holder(&self) -> bool {
        self.temporary_holder
    }

    pub fn was_pre_existing(&self) -> bool {
        self.pre_existing
    }

    /// The remote-AVD handle the device had before the connection touched it.
    pub(crate) fn initial_remote_avd_handle(&self) -> DeviceHandle {
        DeviceHandle::RemoteAvd {
            serial: self.initial_serial.clone(),
            known_ip: self.initial_ip.clone(),
            user: self.initial_user.clone(),
            offset: self.initial_offset,
        }
    }
}

/// Device reachable without any setup, like a USB device or a local emulator.
pub struct DirectConnection {
    base: ConnectionBase,
}

impl DirectConnection {
    pub fn new(base: ConnectionBase) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &ConnectionBase {
        &self.base
    }
}

impl DeviceConnection for DirectConnection {}

pub enum Connection {
    Direct(DirectConnection),
    Tcp(TcpConnection),
    Ssh(SshConnection),
}

impl Connection {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Connection::Direct(_) => "direct",
            Connection::Tcp(_) => "adb-tcp",
            Connection::Ssh(_) => "adb-ssh",
        }
    }

    pub fn base(&self) -> &ConnectionBase {
        match self {
            Connection::Direct(conn) => conn.base(),
            Connection::Tcp(conn) => conn.base(),
            Connection::Ssh(conn) => conn.base(),
        }
    }

    /// The TCP layer, also present under a tunnel-backed connection.
    pub fn as_tcp(&self) -> Option<&TcpConnection> {
        match self {
            Connection::Direct(_) => None,
            Connection::Tcp(conn) => Some(conn),
            Connection::Ssh(conn) => Some(conn.tcp()),
        }
    }

    pub fn as_ssh(&self) -> Option<&SshConnection> {
        match self {
            Connection::Ssh(conn) => Some(conn),
            _ => None,
        }
    }
}

#[async_trait]
impl DeviceConnection for Connection {
    async fn initialize_connection(&mut self) -> ConnectionResult<()> {
        match self {
            Connection::Direct(conn) => conn.initialize_connection().await,
            Connection::Tcp(conn) => conn.initialize_connection().await,
            Connection::Ssh(conn) => conn.initialize_connection().await,
        }
    }

    async fn reconnect(&mut self, serial: &str) -> ConnectionResult<()> {
        match self {
            Connection::Direct(conn) => conn.reconnect(serial).await,
            Connection::Tcp(conn) => conn.reconnect(serial).await,
            Connection::Ssh(conn) => conn.reconnect(serial).await,
        }
    }

    async fn reconnect_for_recovery(&mut self, serial: &str) -> ConnectionResult<()> {
        match self {
            Connection::Direct(conn) => conn.reconnect_for_recovery(serial).await,
            Connection::Tcp(conn) => conn.reconnect_for_recovery(serial).await,
            Connection::Ssh(conn) => conn.reconnect_for_recovery(serial).await,
        }
    }

    fn notify_adb_reboot_called(&self) {
        match self {
            Connection::Direct(conn) => conn.notify_adb_reboot_called(),
            Connection::Tcp(conn) => conn.notify_adb_reboot_called(),
            Connection::Ssh(conn) => conn.notify_adb_reboot_called(),
        }
    }

    async fn tear_down_connection(&mut self) {
        match self {
            Connection::Direct(conn) => conn.tear_down_connection().await,
            Connection::Tcp(conn) => conn.tear_down_connection().await,
            Connection::Ssh(conn) => conn.tear_down_connection().await,
        }
    }

    async fn recover_virtual_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: Option<&str>,
        error: ConnectionError,
    ) -> ConnectionResult<()> {
        match self {
            Connection::Direct(conn) => {
                conn.recover_virtual_device(device, snapshot_id, error).await
            }
            Connection::Tcp(conn) => conn.recover_virtual_device(device, snapshot_id, error).await,
            Connection::Ssh(conn) => conn.recover_virtual_device(device, snapshot_id, error).await,
        }
    }

    async fn snapshot_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: &str,
    ) -> ConnectionResult<()> {
        match self {
            Connection::Direct(conn) => conn.snapshot_device(device, snapshot_id).await,
            Connection::Tcp(conn) => conn.snapshot_device(device, snapshot_id).await,
            Connection::Ssh(conn) => conn.snapshot_device(device, snapshot_id).await,
        }
    }
}
