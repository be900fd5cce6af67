use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies why a device operation failed so callers can branch on the cause
/// rather than on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorId {
    FailedToLaunchGce,
    FailedToConnectToGce,
    FailedToConnectToTcpDevice,
    DeviceUnavailable,
    DeviceUnresponsive,
    DeviceFailedToReset,
    DeviceFailedToSnapshot,
    DeviceFailedToRestoreSnapshot,
    DeviceFailedToDeleteSnapshot,
    DeviceFailedToStop,
    DeviceUnexpectedResponse,
    NoDiskSpace,
    CuttlefishLaunchFailureBluetooth,
    CuttlefishLaunchFailureOpenwrt,
    CuttlefishLaunchFailureWebrtcCrash,
    CuttlefishLaunchFailureCrosvm,
    CuttlefishLaunchFailureNginx,
    CuttlefishLaunchFailureCvdResolveHost,
    CuttlefishLaunchFailureCvdServerConnection,
    CuttlefishLaunchFailureCvdPortCollision,
    CuttlefishLaunchFailureCvdFetch,
    ArtifactNotFound,
    InvalidDeviceSerial,
    Undetermined,
}

impl ErrorId {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorId::FailedToLaunchGce => "FAILED_TO_LAUNCH_GCE",
            ErrorId::FailedToConnectToGce => "FAILED_TO_CONNECT_TO_GCE",
            ErrorId::FailedToConnectToTcpDevice => "FAILED_TO_CONNECT_TO_TCP_DEVICE",
            ErrorId::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            ErrorId::DeviceUnresponsive => "DEVICE_UNRESPONSIVE",
            ErrorId::DeviceFailedToReset => "DEVICE_FAILED_TO_RESET",
            ErrorId::DeviceFailedToSnapshot => "DEVICE_FAILED_TO_SNAPSHOT",
            ErrorId::DeviceFailedToRestoreSnapshot => "DEVICE_FAILED_TO_RESTORE_SNAPSHOT",
            ErrorId::DeviceFailedToDeleteSnapshot => "DEVICE_FAILED_TO_DELETE_SNAPSHOT",
            ErrorId::DeviceFailedToStop => "DEVICE_FAILED_TO_STOP",
            ErrorId::DeviceUnexpectedResponse => "DEVICE_UNEXPECTED_RESPONSE",
            ErrorId::NoDiskSpace => "NO_DISK_SPACE",
            ErrorId::CuttlefishLaunchFailureBluetooth => "CUTTLEFISH_LAUNCH_FAILURE_BLUETOOTH",
            ErrorId::CuttlefishLaunchFailureOpenwrt => "CUTTLEFISH_LAUNCH_FAILURE_OPENWRT",
            ErrorId::CuttlefishLaunchFailureWebrtcCrash => {
                "CUTTLEFISH_LAUNCH_FAILURE_WEBRTC_CRASH"
            }
            ErrorId::CuttlefishLaunchFailureCrosvm => "CUTTLEFISH_LAUNCH_FAILURE_CROSVM",
            ErrorId::CuttlefishLaunchFailureNginx => "CUTTLEFISH_LAUNCH_FAILURE_NGINX",
            ErrorId::CuttlefishLaunchFailureCvdResolveHost => {
                "CUTTLEFISH_LAUNCH_FAILURE_CVD_RESOLVE_HOST"
            }
            ErrorId::CuttlefishLaunchFailureCvdServerConnection => {
                "CUTTLEFISH_LAUNCH_FAILURE_CVD_SERVER_CONNECTION"
            }
            ErrorId::CuttlefishLaunchFailureCvdPortCollision => {
                "CUTTLEFISH_LAUNCH_FAILURE_CVD_PORT_COLLISION"
            }
            ErrorId::CuttlefishLaunchFailureCvdFetch => "CUTTLEFISH_LAUNCH_FAILURE_CVD_FETCH",
            ErrorId::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            ErrorId::InvalidDeviceSerial => "INVALID_DEVICE_SERIAL",
            ErrorId::Undetermined => "UNDETERMINED",
        }
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionError {
    /// Configuration or environment problem; retrying at this layer will not help.
    #[error("[{id}] {message} (device {serial})")]
    Setup {
        message: String,
        serial: String,
        id: ErrorId,
    },
    #[error("[{id}] {message} (device {serial} not available)")]
    NotAvailable {
        message: String,
        serial: String,
        id: ErrorId,
    },
    /// The device is online but does not answer commands.
    #[error("[{id}] {message} (device {serial} unresponsive)")]
    Unresponsive {
        message: String,
        serial: String,
        id: ErrorId,
    },
    #[error("invalid serial format '{serial}', expected <hostname>:<port>")]
    InvalidSerial { serial: String },
    #[error("[{id}] {message}")]
    Runtime { message: String, id: ErrorId },
}

impl ConnectionError {
    pub fn setup(message: impl Into<String>, serial: impl Into<String>, id: ErrorId) -> Self {
        ConnectionError::Setup {
            message: message.into(),
            serial: serial.into(),
            id,
        }
    }

    pub fn not_available(
        message: impl Into<String>,
        serial: impl Into<String>,
        id: ErrorId,
    ) -> Self {
        ConnectionError::NotAvailable {
            message: message.into(),
            serial: serial.into(),
            id,
        }
    }

    pub fn unresponsive(
        message: impl Into<String>,
        serial: impl Into<String>,
        id: ErrorId,
    ) -> Self {
        ConnectionError::Unresponsive {
            message: message.into(),
            serial: serial.into(),
            id,
        }
    }

    pub fn runtime(message: impl Into<String>, id: ErrorId) -> Self {
        ConnectionError::Runtime {
            message: message.into(),
            id,
        }
    }

    pub fn id(&self) -> ErrorId {
        match self {
            ConnectionError::Setup { id, .. }
            | ConnectionError::NotAvailable { id, .. }
            | ConnectionError::Unresponsive { id, .. }
            | ConnectionError::Runtime { id, .. } => *id,
            ConnectionError::InvalidSerial { .. } => ErrorId::InvalidDeviceSerial,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ConnectionError::Setup { message, .. }
            | ConnectionError::NotAvailable { message, .. }
            | ConnectionError::Unresponsive { message, .. }
            | ConnectionError::Runtime { message, .. } => message.clone(),
            ConnectionError::InvalidSerial { .. } => self.to_string(),
        }
    }

    pub fn serial(&self) -> Option<&str> {
        match self {
            ConnectionError::Setup { serial, .. }
            | ConnectionError::NotAvailable { serial, .. }
            | ConnectionError::Unresponsive { serial, .. }
            | ConnectionError::InvalidSerial { serial } => Some(serial),
            ConnectionError::Runtime { .. } => None,
        }
    }

    /// Device-not-available and device-unresponsive both mean the device is gone
    /// from the harness point of view.
    pub fn is_device_not_available(&self) -> bool {
        matches!(
            self,
            ConnectionError::NotAvailable { .. } | ConnectionError::Unresponsive { .. }
        )
    }

    pub fn with_id(self, new_id: ErrorId) -> Self {
        match self {
            ConnectionError::Setup { message, serial, .. } => ConnectionError::Setup {
                message,
                serial,
                id: new_id,
            },
            ConnectionError::NotAvailable { message, serial, .. } => {
                ConnectionError::NotAvailable {
                    message,
                    serial,
                    id: new_id,
                }
            }
            ConnectionError::Unresponsive { message, serial, .. } => {
                ConnectionError::Unresponsive {
                    message,
                    serial,
                    id: new_id,
                }
            }
            ConnectionError::Runtime { message, .. } => ConnectionError::Runtime {
                message,
                id: new_id,
            },
            other @ ConnectionError::InvalidSerial { .. } => other,
        }
    }
}
