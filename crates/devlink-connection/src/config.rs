use std::{fs, io, path::Path, path::PathBuf, time::Duration};

use devlink_util::{env_flag, env_opt, env_u64, expand_user};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADB_PORT: u16 = 5555;
pub const DEFAULT_REMOTE_ADB_PORT: u16 = 6520;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceType {
    #[default]
    Local,
    Gce,
    RemoteAvd,
    Cuttlefish,
    RemoteNestedAvd,
    Emulator,
}

impl InstanceType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LOCAL" => Some(InstanceType::Local),
            "GCE" => Some(InstanceType::Gce),
            "REMOTE_AVD" => Some(InstanceType::RemoteAvd),
            "CUTTLEFISH" => Some(InstanceType::Cuttlefish),
            "REMOTE_NESTED_AVD" => Some(InstanceType::RemoteNestedAvd),
            "EMULATOR" => Some(InstanceType::Emulator),
            _ => None,
        }
    }

    /// Remote virtual devices whose adb may be reachable either directly or through
    /// a tunnel.
    pub fn is_remote_avd(self) -> bool {
        matches!(self, InstanceType::Cuttlefish | InstanceType::RemoteNestedAvd)
    }
}

/// Per-device options. Durations are stored in milliseconds so the struct reads
/// and writes as plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub instance_type: InstanceType,
    pub evaluate_device_connection: bool,
    pub gce_cmd_timeout_ms: u64,
    pub gce_max_attempt: u32,
    pub adb_connect_wait_time_ms: u64,
    pub instance_user: String,
    pub ssh_private_key_path: Option<PathBuf>,
    pub skip_tear_down: bool,
    pub use_oxygen: bool,
    pub logcat_capture_enabled: bool,
    pub gce_driver_params: Vec<String>,
    pub remote_adb_port: u16,
    pub recovery_probe_timeout_ms: u64,
    pub inspect_host_on_launch_failure: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            instance_type: InstanceType::Local,
            evaluate_device_connection: true,
            gce_cmd_timeout_ms: 30 * 60 * 1000,
            gce_max_attempt: 1,
            adb_connect_wait_time_ms: 2 * 60 * 1000,
            instance_user: "root".into(),
            ssh_private_key_path: None,
            skip_tear_down: false,
            use_oxygen: false,
            logcat_capture_enabled: true,
            gce_driver_params: Vec::new(),
            remote_adb_port: DEFAULT_REMOTE_ADB_PORT,
            recovery_probe_timeout_ms: 30 * 1000,
            inspect_host_on_launch_failure: true,
        }
    }
}

impl DeviceOptions {
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Defaults overridden by `DEVLINK_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(kind) = env_opt("DEVLINK_INSTANCE_TYPE").and_then(|v| InstanceType::parse(&v)) {
            self.instance_type = kind;
        }
        self.evaluate_device_connection =
            env_flag("DEVLINK_EVALUATE_CONNECTION", self.evaluate_device_connection);
        self.gce_cmd_timeout_ms = env_u64("DEVLINK_GCE_CMD_TIMEOUT_MS", self.gce_cmd_timeout_ms);
        self.gce_max_attempt =
            env_u64("DEVLINK_GCE_MAX_ATTEMPT", self.gce_max_attempt as u64).max(1) as u32;
        self.adb_connect_wait_time_ms =
            env_u64("DEVLINK_ADB_CONNECT_WAIT_MS", self.adb_connect_wait_time_ms);
        if let Some(user) = env_opt("DEVLINK_INSTANCE_USER") {
            self.instance_user = user;
        }
        if let Some(key) = env_opt("DEVLINK_SSH_KEY") {
            self.ssh_private_key_path = Some(expand_user(&key));
        }
        self.skip_tear_down = env_flag("DEVLINK_SKIP_TEAR_DOWN", self.skip_tear_down);
        self.use_oxygen = env_flag("DEVLINK_USE_OXYGEN", self.use_oxygen);
        self.logcat_capture_enabled = env_flag("DEVLINK_LOGCAT", self.logcat_capture_enabled);
        if let Some(params) = env_opt("DEVLINK_GCE_DRIVER_PARAMS") {
            self.gce_driver_params = params.split_whitespace().map(str::to_string).collect();
        }
        self.remote_adb_port =
            env_u64("DEVLINK_REMOTE_ADB_PORT", self.remote_adb_port as u64) as u16;
        self.recovery_probe_timeout_ms =
            env_u64("DEVLINK_RECOVERY_PROBE_TIMEOUT_MS", self.recovery_probe_timeout_ms);
        self.inspect_host_on_launch_failure = env_flag(
            "DEVLINK_INSPECT_ON_LAUNCH_FAILURE",
            self.inspect_host_on_launch_failure,
        );
        self
    }

    pub fn gce_cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.gce_cmd_timeout_ms)
    }

    pub fn adb_connect_wait_time(&self) -> Duration {
        Duration::from_millis(self.adb_connect_wait_time_ms)
    }

    pub fn recovery_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_probe_timeout_ms)
    }

    pub fn ssh_key(&self) -> Option<String> {
        self.ssh_private_key_path
            .as_ref()
            .map(|path| path.display().to_string())
    }

    /// Value following `--kernel-build-id` in the launcher driver params.
    pub fn requested_kernel_build_id(&self) -> Option<&str> {
        let idx = self
            .gce_driver_params
            .iter()
            .position(|param| param == "--kernel-build-id")?;
        self.gce_driver_params
            .get(idx + 1)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

/// Process-wide options shared by every connection the factory builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    pub concurrent_virtual_device_startup_limit: Option<usize>,
}

impl HostOptions {
    pub fn from_env() -> Self {
        Self {
            concurrent_virtual_device_startup_limit: env_opt("DEVLINK_VM_STARTUP_LIMIT")
                .and_then(|value| value.parse().ok())
                .filter(|limit| *limit > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        fs::write(
            &path,
            r#"{"instance_type": "CUTTLEFISH", "instance_user": "vsoc-01", "gce_max_attempt": 3}"#,
        )
        .unwrap();
        let options = DeviceOptions::from_json_file(&path).unwrap();
        assert_eq!(options.instance_type, InstanceType::Cuttlefish);
        assert_eq!(options.instance_user, "vsoc-01");
        assert_eq!(options.gce_max_attempt, 3);
        assert_eq!(options.remote_adb_port, DEFAULT_REMOTE_ADB_PORT);
        assert_eq!(options.recovery_probe_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn kernel_build_id_comes_from_driver_params() {
        let mut options = DeviceOptions::default();
        assert_eq!(options.requested_kernel_build_id(), None);
        options.gce_driver_params = vec![
            "--branch".into(),
            "main".into(),
            "--kernel-build-id".into(),
            "11223344".into(),
        ];
        assert_eq!(options.requested_kernel_build_id(), Some("11223344"));
        options.gce_driver_params.truncate(3);
        assert_eq!(options.requested_kernel_build_id(), None);
    }

    #[test]
    fn instance_type_parsing_is_lenient() {
        assert_eq!(
            InstanceType::parse("remote-nested-avd"),
            Some(InstanceType::RemoteNestedAvd)
        );
        assert_eq!(InstanceType::parse("bogus"), None);
        assert!(InstanceType::Cuttlefish.is_remote_avd());
        assert!(!InstanceType::Gce.is_remote_avd());
    }
}
