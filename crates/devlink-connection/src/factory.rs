use std::sync::Arc;

use devlink_telemetry::InvocationMetrics;
use devlink_util::{CommandRunner, HostRunner};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::adb_tcp::is_tcp_device_serial;
use crate::config::{DeviceOptions, HostOptions, InstanceType};
use crate::connection::{BaseParts, Connection, ConnectionBase, DirectConnection};
use crate::device::{DeviceHandle, DeviceKind, ManagedDevice};
use crate::feature::FeatureClient;
use crate::instance::VmInstanceInfo;
use crate::launcher::{BuildInfo, LaunchAttributes, LauncherFactory};
use crate::logger::{NullLogger, TestLogger};
use crate::snapshot::SnapshotHandler;
use crate::ssh::SshConnection;
use crate::tcp::TcpConnection;
use crate::tunnel::{SshTunnelSpawner, TunnelSpawner};

/// Everything a connection needs to know about the device it serves.
pub struct ConnectionBuilder {
    device: Arc<dyn ManagedDevice>,
    options: DeviceOptions,
    logger: Arc<dyn TestLogger>,
    build_info: BuildInfo,
    attributes: LaunchAttributes,
    existing_instance: Option<VmInstanceInfo>,
    pre_existing: bool,
    device_name: Option<String>,
    feature_client: Option<Arc<dyn FeatureClient>>,
}

impl ConnectionBuilder {
    pub fn new(device: Arc<dyn ManagedDevice>, options: DeviceOptions) -> Self {
        Self {
            device,
            options,
            logger: Arc::new(NullLogger),
            build_info: BuildInfo::default(),
            attributes: LaunchAttributes::new(),
            existing_instance: None,
            pre_existing: false,
            device_name: None,
            feature_client: None,
        }
    }

    pub fn logger(mut self, logger: Arc<dyn TestLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn build_info(mut self, build_info: BuildInfo) -> Self {
        self.build_info = build_info;
        self
    }

    pub fn add_attributes(mut self, attributes: LaunchAttributes) -> Self {
        for (key, values) in attributes {
            self.attributes.entry(key).or_default().extend(values);
        }
        self
    }

    pub fn add_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Adopts an already launched instance instead of launching one.
    pub fn existing_instance(mut self, instance: VmInstanceInfo) -> Self {
        self.existing_instance = Some(instance);
        self
    }

    pub fn mark_pre_existing(mut self) -> Self {
        self.pre_existing = true;
        self
    }

    /// Name the device is known by in the invocation; defaults to its serial.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn feature_client(mut self, client: Arc<dyn FeatureClient>) -> Self {
        self.feature_client = Some(client);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChoice {
    Direct,
    Tcp { pre_existing: bool },
    Ssh,
}

/// Picks the channel for a device from its kind and declared instance type.
pub fn select_connection(
    kind: DeviceKind,
    options: &DeviceOptions,
    serial: &str,
    handle: &DeviceHandle,
) -> ConnectionChoice {
    let instance_type = options.instance_type;
    if !options.evaluate_device_connection {
        debug!("instance type for connection: {instance_type:?}");
        match kind {
            DeviceKind::RemoteVirtual => return ConnectionChoice::Ssh,
            DeviceKind::RemoteAndroid => return ConnectionChoice::Tcp { pre_existing: false },
            DeviceKind::Native => {}
        }
    }

    debug!("instance type for connection: {instance_type:?}, evaluating connection type");
    if !instance_type.is_remote_avd() {
        return ConnectionChoice::Direct;
    }
    if is_tcp_device_serial(serial) {
        return ConnectionChoice::Tcp { pre_existing: false };
    }
    let known_ip = matches!(handle, DeviceHandle::RemoteAvd { known_ip: Some(_), .. });
    if instance_type == InstanceType::RemoteNestedAvd && known_ip {
        return ConnectionChoice::Tcp { pre_existing: true };
    }
    ConnectionChoice::Ssh
}

/// Builds connections for every device of an invocation. Holds what those
/// connections share: the host runner, the tunnel spawner, the launcher factory,
/// the metrics store and the virtual device startup permits.
pub struct ConnectionFactory {
    runner: Arc<dyn CommandRunner>,
    spawner: Arc<dyn TunnelSpawner>,
    launcher_factory: LauncherFactory,
    metrics: InvocationMetrics,
    startup_permits: Option<Arc<Semaphore>>,
}

impl ConnectionFactory {
    pub fn new(host: &HostOptions, launcher_factory: LauncherFactory) -> Self {
        Self {
            runner: Arc::new(HostRunner),
            spawner: Arc::new(SshTunnelSpawner),
            launcher_factory,
            metrics: InvocationMetrics::new(),
            startup_permits: host
                .concurrent_virtual_device_startup_limit
                .map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn TunnelSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_metrics(mut self, metrics: InvocationMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &InvocationMetrics {
        &self.metrics
    }

    pub fn startup_permits(&self) -> Option<&Arc<Semaphore>> {
        self.startup_permits.as_ref()
    }

    /// A connection that does nothing, whatever the device.
    pub fn create_inop_connection(&self, builder: ConnectionBuilder) -> Connection {
        let (base, _) = self.base(builder, false);
        Connection::Direct(DirectConnection::new(base))
    }

    pub fn create_connection(&self, builder: ConnectionBuilder) -> Connection {
        let choice = select_connection(
            builder.device.kind(),
            &builder.options,
            &builder.device.serial(),
            &builder.device.device_handle(),
        );
        match choice {
            ConnectionChoice::Direct => {
                let (base, _) = self.base(builder, false);
                Connection::Direct(DirectConnection::new(base))
            }
            ConnectionChoice::Tcp { pre_existing } => {
                let (base, _) = self.base(builder, pre_existing);
                Connection::Tcp(TcpConnection::new(base))
            }
            ConnectionChoice::Ssh => {
                let (base, existing) = self.base(builder, false);
                Connection::Ssh(SshConnection::new(
                    base,
                    existing,
                    Arc::clone(&self.launcher_factory),
                    Arc::clone(&self.spawner),
                    self.startup_permits.clone(),
                ))
            }
        }
    }

    fn base(
        &self,
        builder: ConnectionBuilder,
        mark_pre_existing: bool,
    ) -> (ConnectionBase, Option<VmInstanceInfo>) {
        let device_name = builder
            .device_name
            .unwrap_or_else(|| builder.device.serial());
        let snapshots = builder
            .feature_client
            .map(|client| SnapshotHandler::new(client, self.metrics.clone()));
        let base = ConnectionBase::new(BaseParts {
            runner: Arc::clone(&self.runner),
            device: builder.device,
            build_info: builder.build_info,
            attributes: builder.attributes,
            logger: builder.logger,
            options: builder.options,
            metrics: self.metrics.clone(),
            snapshots,
            device_name,
            pre_existing: builder.pre_existing || mark_pre_existing,
        });
        (base, builder.existing_instance)
    }
}
