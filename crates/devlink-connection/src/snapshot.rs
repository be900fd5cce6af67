//! Snapshot and restore over the feature RPC.
//!
//! The client half runs wherever a connection decides to snapshot or restore a
//! device; the server half owns the virtual devices and runs the host commands.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use async_trait::async_trait;
use devlink_proto::devlink::v1::{ErrorInfo, FeatureRequest, FeatureResponse};
use devlink_telemetry::{InvocationMetrics, MetricKey};
use devlink_util::CommandResult;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::device::ManagedDevice;
use crate::error::{ConnectionError, ConnectionResult, ErrorId};
use crate::feature::{
    decode_error_trace, encode_error_trace, error_response, success_response, FeatureClient,
    FeatureHandler,
};
use crate::instance::VmInstanceInfo;

pub const DEVICE_SNAPSHOT_FEATURE_NAME: &str = "snapshotDevice";
pub const DEVICE_NAME: &str = "device_name";
pub const SNAPSHOT_ID: &str = "snapshot_id";
pub const RESTORE_FLAG: &str = "restore_flag";

static SNAPSHOT_DURATION: DurationPattern =
    DurationPattern::new(r"Snapshot\sfinished\sin (\d+)\sms");
static RESTORE_DURATION: DurationPattern =
    DurationPattern::new(r"Restoring snapshot\sfinished\sin (\d+)\sms");

/// Millisecond duration reported in a feature response, compiled on first use.
struct DurationPattern {
    pattern: &'static str,
    compiled: OnceLock<Option<Regex>>,
}

impl DurationPattern {
    const fn new(pattern: &'static str) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    fn parse(&self, response: &str) -> Option<u64> {
        let re = self
            .compiled
            .get_or_init(|| Regex::new(self.pattern).ok())
            .as_ref()?;
        re.captures(response)?.get(1)?.as_str().parse().ok()
    }
}

/// Client side: asks the feature server to snapshot or restore a device.
#[derive(Clone)]
pub struct SnapshotHandler {
    client: Arc<dyn FeatureClient>,
    metrics: InvocationMetrics,
}

impl SnapshotHandler {
    pub fn new(client: Arc<dyn FeatureClient>, metrics: InvocationMetrics) -> Self {
        Self { client, metrics }
    }

    pub async fn snapshot_device(
        &self,
        device: &dyn ManagedDevice,
        device_name: &str,
        snapshot_id: &str,
    ) -> ConnectionResult<()> {
        if device.device_handle().is_stub() {
            debug!(
                "device '{}' is a placeholder, skipping snapshot",
                device.serial()
            );
            return Ok(());
        }
        let args = HashMap::from([
            (DEVICE_NAME.to_string(), device_name.to_string()),
            (SNAPSHOT_ID.to_string(), snapshot_id.to_string()),
        ]);
        let response = self
            .call(args, "Exception while snapshotting the device")
            .await?;
        debug!("response from snapshot request: {response}");
        if let Some(duration) = SNAPSHOT_DURATION.parse(&response) {
            self.metrics.increment(MetricKey::DeviceSnapshotSuccessCount);
            self.metrics.push(MetricKey::DeviceSnapshotDurations, duration);
        }
        Ok(())
    }

    pub async fn restore_snapshot_device(
        &self,
        device: &dyn ManagedDevice,
        device_name: &str,
        snapshot_id: &str,
    ) -> ConnectionResult<()> {
        if device.device_handle().is_stub() {
            debug!(
                "device '{}' is a placeholder, skipping snapshot restore",
                device.serial()
            );
            return Ok(());
        }
        let args = HashMap::from([
            (DEVICE_NAME.to_string(), device_name.to_string()),
            (SNAPSHOT_ID.to_string(), snapshot_id.to_string()),
            (RESTORE_FLAG.to_string(), "true".to_string()),
        ]);
        let response = self
            .call(args, "Exception while restoring snapshot of the device")
            .await?;
        debug!("response from restoring snapshot({snapshot_id}) request: {response}");
        if let Some(duration) = RESTORE_DURATION.parse(&response) {
            self.metrics
                .increment(MetricKey::DeviceSnapshotRestoreSuccessCount);
            self.metrics
                .push(MetricKey::DeviceSnapshotRestoreDurations, duration);
        }
        Ok(())
    }

    async fn call(&self, args: HashMap<String, String>, context: &str) -> ConnectionResult<String> {
        let response = self
            .client
            .trigger_feature(DEVICE_SNAPSHOT_FEATURE_NAME, args)
            .await?;
        if let Some(ErrorInfo { error_trace }) = response.error_info {
            return Err(decode_error_trace(&error_trace, context));
        }
        Ok(response.response.unwrap_or_default())
    }
}

/// A virtual device the snapshot feature can act on.
#[async_trait]
pub trait SnapshotTarget: Send + Sync {
    fn serial(&self) -> String;
    /// `None` until the device has been launched or adopted.
    fn instance(&self) -> Option<VmInstanceInfo>;
    async fn snapshot(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult>;
    async fn restore_snapshot(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult>;
}

/// Server side of the snapshot feature. Devices are registered under the name the
/// client sends as `device_name`.
#[derive(Default)]
pub struct SnapshotFeature {
    targets: Mutex<HashMap<String, Arc<dyn SnapshotTarget>>>,
}

impl SnapshotFeature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_name: impl Into<String>, target: Arc<dyn SnapshotTarget>) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(device_name.into(), target);
        }
    }

    pub fn unregister(&self, device_name: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.remove(device_name);
        }
    }

    fn target(&self, device_name: &str) -> Option<Arc<dyn SnapshotTarget>> {
        self.targets
            .lock()
            .ok()
            .and_then(|targets| targets.get(device_name).cloned())
    }

    async fn snapshot(
        &self,
        target: &dyn SnapshotTarget,
        instance: &VmInstanceInfo,
        snapshot_id: &str,
    ) -> ConnectionResult<String> {
        let serial = target.serial();
        let mut response = format!("Attempting snapshot device on {serial}.");
        let start = Instant::now();
        let result = target
            .snapshot(
                instance.instance_user.as_deref(),
                instance.device_offset,
                snapshot_id,
            )
            .await?;
        if !result.is_success() {
            return Err(command_failure("Failed to snapshot device", &serial, &result));
        }
        response.push_str(&format!(
            " Snapshot finished in {} ms.",
            start.elapsed().as_millis()
        ));
        Ok(response)
    }

    async fn restore(
        &self,
        target: &dyn SnapshotTarget,
        instance: &VmInstanceInfo,
        snapshot_id: &str,
    ) -> ConnectionResult<String> {
        let serial = target.serial();
        let mut response =
            format!("Attempting restore device snapshot on {serial} to {snapshot_id}.");
        let start = Instant::now();
        let result = target
            .restore_snapshot(
                instance.instance_user.as_deref(),
                instance.device_offset,
                snapshot_id,
            )
            .await?;
        if !result.is_success() {
            return Err(command_failure(
                "Failed to restore snapshot on device",
                &serial,
                &result,
            ));
        }
        response.push_str(&format!(
            " Restoring snapshot finished in {} ms.",
            start.elapsed().as_millis()
        ));
        Ok(response)
    }
}

fn command_failure(what: &str, serial: &str, result: &CommandResult) -> ConnectionError {
    ConnectionError::not_available(
        format!(
            "{what}: {serial}. status:{:?}\nstdout: {}\nstderr:{}",
            result.status, result.stdout, result.stderr
        ),
        serial,
        ErrorId::DeviceFailedToSnapshot,
    )
}

#[async_trait]
impl FeatureHandler for SnapshotFeature {
    fn name(&self) -> &'static str {
        DEVICE_SNAPSHOT_FEATURE_NAME
    }

    async fn execute(&self, request: FeatureRequest) -> FeatureResponse {
        let Some(device_name) = request.args.get(DEVICE_NAME) else {
            return FeatureResponse {
                response: None,
                error_info: Some(ErrorInfo {
                    error_trace: "No device_name args specified.".into(),
                }),
            };
        };
        let Some(target) = self.target(device_name) else {
            return success_response(format!(" {device_name} has no snapshot support."));
        };
        let Some(instance) = target.instance() else {
            return error_response(&ConnectionError::runtime(
                "virtual device info was null, skipping",
                ErrorId::DeviceUnavailable,
            ));
        };
        let snapshot_id = request
            .args
            .get(SNAPSHOT_ID)
            .map(String::as_str)
            .unwrap_or_default();
        let restore = request
            .args
            .get(RESTORE_FLAG)
            .is_some_and(|flag| flag == "true");
        let outcome = if restore {
            self.restore(target.as_ref(), &instance, snapshot_id).await
        } else {
            self.snapshot(target.as_ref(), &instance, snapshot_id).await
        };
        match outcome {
            Ok(text) => success_response(text),
            Err(err) => {
                error!("snapshot feature failed for {device_name}: {err}");
                FeatureResponse {
                    response: None,
                    error_info: Some(ErrorInfo {
                        error_trace: encode_error_trace(&err),
                    }),
                }
            }
        }
    }
}
