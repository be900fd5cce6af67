use std::{fs, sync::Arc, time::Duration};

use async_trait::async_trait;
use devlink_telemetry::MetricKey;
use tracing::{debug, info, warn};

use crate::adb_tcp::{host_name, port_num, AdbTcp};
use crate::config::DEFAULT_ADB_PORT;
use crate::connection::{ConnectionBase, DeviceConnection};
use crate::device::{DeviceHandle, ManagedDevice};
use crate::error::{ConnectionError, ConnectionResult, ErrorId};

/// adb over TCP to a `host:port` serial.
pub struct TcpConnection {
    base: ConnectionBase,
    adb: Arc<AdbTcp>,
}

impl TcpConnection {
    pub fn new(base: ConnectionBase) -> Self {
        let adb = Arc::new(AdbTcp::new(Arc::clone(base.runner())));
        Self { base, adb }
    }

    pub fn base(&self) -> &ConnectionBase {
        &self.base
    }

    pub fn adb(&self) -> &Arc<AdbTcp> {
        &self.adb
    }

    pub fn host_name(&self, serial: &str) -> ConnectionResult<String> {
        host_name(serial)
    }

    pub fn port_num(&self, serial: &str) -> ConnectionResult<String> {
        port_num(serial)
    }

    pub async fn adb_tcp_connect(&self, host: &str, port: &str) -> bool {
        self.adb.connect(host, port).await
    }

    pub async fn adb_tcp_disconnect(&self, host: &str, port: &str) -> bool {
        self.adb.disconnect(host, port).await
    }

    pub async fn wait_for_adb_connect(&self, serial: &str, wait: Duration) -> ConnectionResult<()> {
        self.adb.wait_for_connect(serial, wait).await
    }

    fn missing_feature_client(&self, what: &str) -> ConnectionError {
        ConnectionError::runtime(
            format!("cannot {what}: no feature client configured"),
            ErrorId::Undetermined,
        )
    }
}

#[async_trait]
impl DeviceConnection for TcpConnection {
    async fn initialize_connection(&mut self) -> ConnectionResult<()> {
        if !self.base.was_pre_existing() {
            return Ok(());
        }
        let Some(ip) = self.base.initial_ip().map(str::to_string) else {
            warn!(
                "pre-existing device {} has no known ip, nothing to connect",
                self.base.initial_serial()
            );
            return Ok(());
        };
        let port = (DEFAULT_ADB_PORT as u32 + self.base.initial_offset().unwrap_or(0)).to_string();
        let serial = format!("{ip}:{port}");
        self.adb.disconnect(&ip, &port).await;
        self.base.device().set_device_handle(DeviceHandle::RemoteAvd {
            serial: serial.clone(),
            known_ip: Some(ip),
            user: None,
            offset: None,
        });
        self.reconnect(&serial).await
    }

    async fn reconnect(&mut self, serial: &str) -> ConnectionResult<()> {
        let host = host_name(serial)?;
        let port = port_num(serial)?;
        self.adb.connect(&host, &port).await;
        self.adb
            .wait_for_connect(serial, self.base.options().adb_connect_wait_time())
            .await
    }

    async fn tear_down_connection(&mut self) {
        if let Some(path) = self.adb.connect_log() {
            self.adb.set_connect_log(None);
            if let Err(err) = fs::remove_file(&path) {
                debug!("adb connect log {} not removed: {err}", path.display());
            }
        }
        if self.base.was_pre_existing() {
            self.base
                .device()
                .set_device_handle(self.base.initial_remote_avd_handle());
        }
    }

    async fn recover_virtual_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: Option<&str>,
        error: ConnectionError,
    ) -> ConnectionResult<()> {
        let metrics = self.base.metrics();
        match snapshot_id.filter(|id| !id.is_empty()) {
            None => {
                let serial = device.serial();
                if !device.reset_device().await {
                    return Err(ConnectionError::not_available(
                        format!("Failed to recover device: {serial}. {}", error.message()),
                        serial,
                        ErrorId::DeviceFailedToReset,
                    ));
                }
                info!("device {serial} recovered by a device reset");
            }
            Some(snapshot_id) => {
                let Some(handler) = self.base.snapshots() else {
                    warn!("{}", self.missing_feature_client("restore a snapshot"));
                    return Err(error);
                };
                handler
                    .restore_snapshot_device(device, self.base.device_name(), snapshot_id)
                    .await?;
            }
        }
        metrics.increment(MetricKey::DeviceRecoveredFromDeviceReset);
        Ok(())
    }

    async fn snapshot_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: &str,
    ) -> ConnectionResult<()> {
        if snapshot_id.is_empty() {
            return Ok(());
        }
        let Some(handler) = self.base.snapshots() else {
            return Err(self.missing_feature_client("snapshot the device"));
        };
        handler
            .snapshot_device(device, self.base.device_name(), snapshot_id)
            .await
    }
}
