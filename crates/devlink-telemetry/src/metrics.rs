use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKey {
    RecoveryTime,
    RecoveryRoutineCount,
    DeviceRecoveredFromSshTunnel,
    DeviceRecoveredFromDeviceReset,
    PowerwashTime,
    PowerwashSuccessCount,
    PowerwashFailureCount,
    DeviceStopDurations,
    DeviceStopSuccessCount,
    DeviceStopFailureCount,
    DeviceSnapshotSuccessCount,
    DeviceSnapshotFailureCount,
    DeviceSnapshotDurations,
    DeviceSnapshotRestoreSuccessCount,
    DeviceSnapshotRestoreFailureCount,
    DeviceSnapshotRestoreDurations,
    VirtualDeviceLaunchTime,
    VirtualDeviceStartupQueueTime,
}

impl MetricKey {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::RecoveryTime => "recovery_time",
            MetricKey::RecoveryRoutineCount => "recovery_routine_count",
            MetricKey::DeviceRecoveredFromSshTunnel => "device_recovered_from_ssh_tunnel",
            MetricKey::DeviceRecoveredFromDeviceReset => "device_recovered_from_device_reset",
            MetricKey::PowerwashTime => "powerwash_time",
            MetricKey::PowerwashSuccessCount => "powerwash_success_count",
            MetricKey::PowerwashFailureCount => "powerwash_failure_count",
            MetricKey::DeviceStopDurations => "device_stop_durations",
            MetricKey::DeviceStopSuccessCount => "device_stop_success_count",
            MetricKey::DeviceStopFailureCount => "device_stop_failure_count",
            MetricKey::DeviceSnapshotSuccessCount => "device_snapshot_success_count",
            MetricKey::DeviceSnapshotFailureCount => "device_snapshot_failure_count",
            MetricKey::DeviceSnapshotDurations => "device_snapshot_durations",
            MetricKey::DeviceSnapshotRestoreSuccessCount => {
                "device_snapshot_restore_success_count"
            }
            MetricKey::DeviceSnapshotRestoreFailureCount => {
                "device_snapshot_restore_failure_count"
            }
            MetricKey::DeviceSnapshotRestoreDurations => "device_snapshot_restore_durations",
            MetricKey::VirtualDeviceLaunchTime => "virtual_device_launch_time",
            MetricKey::VirtualDeviceStartupQueueTime => "virtual_device_startup_queue_time",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(i64),
    Values(Vec<String>),
}

/// Metrics for one invocation. Clones share the same store, so a connection and
/// its helpers can record into the same place the harness later reads from.
#[derive(Debug, Clone, Default)]
pub struct InvocationMetrics {
    inner: Arc<Mutex<BTreeMap<MetricKey, MetricValue>>>,
}

impl InvocationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to a counter (durations in milliseconds accumulate the same way).
    pub fn add(&self, key: MetricKey, delta: i64) {
        let mut guard = self.lock();
        match guard.get_mut(&key) {
            Some(MetricValue::Count(current)) => *current += delta,
            _ => {
                guard.insert(key, MetricValue::Count(delta));
            }
        }
    }

    pub fn increment(&self, key: MetricKey) {
        self.add(key, 1);
    }

    /// Appends a value to a list metric, like per-call durations.
    pub fn push(&self, key: MetricKey, value: impl ToString) {
        let mut guard = self.lock();
        match guard.get_mut(&key) {
            Some(MetricValue::Values(values)) => values.push(value.to_string()),
            _ => {
                guard.insert(key, MetricValue::Values(vec![value.to_string()]));
            }
        }
    }

    pub fn count(&self, key: MetricKey) -> i64 {
        match self.lock().get(&key) {
            Some(MetricValue::Count(value)) => *value,
            _ => 0,
        }
    }

    pub fn values(&self, key: MetricKey) -> Vec<String> {
        match self.lock().get(&key) {
            Some(MetricValue::Values(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    pub fn contains(&self, key: MetricKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricValue> {
        self.lock()
            .iter()
            .map(|(key, value)| (key.as_str().to_string(), value.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<MetricKey, MetricValue>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
