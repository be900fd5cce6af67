use std::time::Duration;

use async_trait::async_trait;
use crate::error::ConnectionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    None,
    OnlineOnly,
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Recovery,
    Bootloader,
    Fastboot,
    NotAvailable,
}

impl DeviceState {
    pub fn from_adb_state(state: &str) -> Self {
        match state.trim() {
            "device" => DeviceState::Online,
            "unauthorized" => DeviceState::Unauthorized,
            "recovery" => DeviceState::Recovery,
            "bootloader" => DeviceState::Bootloader,
            "fastboot" => DeviceState::Fastboot,
            "offline" => DeviceState::Offline,
            _ => DeviceState::NotAvailable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Online => "ONLINE",
            DeviceState::Offline => "OFFLINE",
            DeviceState::Unauthorized => "UNAUTHORIZED",
            DeviceState::Recovery => "RECOVERY",
            DeviceState::Bootloader => "BOOTLOADER",
            DeviceState::Fastboot => "FASTBOOT",
            DeviceState::NotAvailable => "NOT_AVAILABLE",
        }
    }
}

/// What kind of managed device the harness allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Native,
    RemoteAndroid,
    RemoteVirtual,
}

/// The transport identity currently attached to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceHandle {
    Live {
        serial: String,
    },
    RemoteAvd {
        serial: String,
        known_ip: Option<String>,
        user: Option<String>,
        offset: Option<u32>,
    },
    VmRemote {
        serial: String,
        known_ip: Option<String>,
    },
    Placeholder {
        serial: String,
        temporary: bool,
    },
}

impl DeviceHandle {
    pub fn serial(&self) -> &str {
        match self {
            DeviceHandle::Live { serial }
            | DeviceHandle::RemoteAvd { serial, .. }
            | DeviceHandle::VmRemote { serial, .. }
            | DeviceHandle::Placeholder { serial, .. } => serial,
        }
    }

    pub fn known_ip(&self) -> Option<&str> {
        match self {
            DeviceHandle::RemoteAvd { known_ip, .. } | DeviceHandle::VmRemote { known_ip, .. } => {
                known_ip.as_deref()
            }
            _ => None,
        }
    }

    pub fn known_user(&self) -> Option<&str> {
        match self {
            DeviceHandle::RemoteAvd { user, .. } => user.as_deref(),
            _ => None,
        }
    }

    pub fn device_offset(&self) -> Option<u32> {
        match self {
            DeviceHandle::RemoteAvd { offset, .. } => *offset,
            _ => None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, DeviceHandle::Placeholder { temporary: true, .. })
    }

    /// Placeholders stand in for a device slot that has no transport at all.
    pub fn is_stub(&self) -> bool {
        matches!(self, DeviceHandle::Placeholder { .. })
    }
}

/// The device object the harness owns. The connection drives it but never
/// implements shell or file transfer itself.
#[async_trait]
pub trait ManagedDevice: Send + Sync {
    fn serial(&self) -> String;
    fn kind(&self) -> DeviceKind;
    fn device_handle(&self) -> DeviceHandle;
    fn set_device_handle(&self, handle: DeviceHandle);
    fn state(&self) -> DeviceState;
    fn recovery_mode(&self) -> RecoveryMode;
    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Waits for the device to report boot complete. Returns false on timeout.
    async fn wait_for_device_available(&self, timeout: Duration) -> bool;
    async fn wait_for_device_not_available(&self, timeout: Duration) -> bool;
    async fn wait_for_device_shell(&self, timeout: Duration) -> bool;
    async fn wait_for_device_online(&self, timeout: Duration) -> ConnectionResult<()>;

    async fn execute_shell_command(&self, command: &str) -> ConnectionResult<String>;
    async fn enable_adb_root(&self) -> ConnectionResult<bool>;

    async fn start_logcat(&self) {}
    async fn stop_logcat(&self) {}
    async fn clear_logcat(&self) {}

    /// Device-level reset used when no snapshot is available. Returns success.
    async fn reset_device(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adb_states_map_to_device_states() {
        assert_eq!(DeviceState::from_adb_state("device\n"), DeviceState::Online);
        assert_eq!(DeviceState::from_adb_state("offline"), DeviceState::Offline);
        assert_eq!(DeviceState::from_adb_state("sideload"), DeviceState::NotAvailable);
    }

    #[test]
    fn handle_accessors() {
        let handle = DeviceHandle::RemoteAvd {
            serial: "10.0.0.2:5556".into(),
            known_ip: Some("10.0.0.2".into()),
            user: Some("vsoc-01".into()),
            offset: Some(1),
        };
        assert_eq!(handle.serial(), "10.0.0.2:5556");
        assert_eq!(handle.known_ip(), Some("10.0.0.2"));
        assert_eq!(handle.known_user(), Some("vsoc-01"));
        assert_eq!(handle.device_offset(), Some(1));
        assert!(!handle.is_stub());
        assert!(!DeviceHandle::Live { serial: "abc".into() }.is_stub());
        assert!(DeviceHandle::Placeholder {
            serial: "gce-device-0".into(),
            temporary: true
        }
        .is_temporary());
        assert!(DeviceHandle::Placeholder {
            serial: "gce-device-0".into(),
            temporary: false
        }
        .is_stub());
    }
}
