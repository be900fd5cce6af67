//! Device connection lifecycle: bringing up the channel to a device (local adb,
//! adb over TCP, or adb through an ssh tunnel to a remote virtual device),
//! keeping it alive across reboots and failures, and tearing it down while
//! collecting diagnostics.

pub mod adb_tcp;
pub mod artifacts;
pub mod config;
pub mod connection;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod factory;
pub mod feature;
pub mod instance;
pub mod launcher;
pub mod logger;
pub mod remote;
pub mod snapshot;
pub mod ssh;
pub mod tcp;
pub mod tunnel;

pub use config::{DeviceOptions, HostOptions, InstanceType};
pub use connection::{Connection, ConnectionBase, DeviceConnection, DirectConnection};
pub use device::{DeviceHandle, DeviceKind, DeviceState, ManagedDevice, RecoveryMode};
pub use error::{ConnectionError, ConnectionResult, ErrorId};
pub use factory::{ConnectionBuilder, ConnectionChoice, ConnectionFactory};
pub use instance::{HostAndPort, VmInstanceInfo, VmStatus};
pub use launcher::{BuildInfo, LaunchAttributes, LaunchRequest, LauncherFactory, VmLauncher};
pub use logger::{DirectoryLogger, LogDataType, NullLogger, TestLogger};
pub use snapshot::{SnapshotFeature, SnapshotHandler, SnapshotTarget};
pub use ssh::{RemoteVm, SshConnection};
pub use tcp::TcpConnection;
pub use tunnel::{TunnelMonitor, TunnelState};
