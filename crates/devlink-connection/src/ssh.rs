//! adb over an ssh tunnel to a virtual device running on a remote host.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use devlink_telemetry::{InvocationMetrics, MetricKey};
use devlink_util::{free_local_port, CommandResult, CommandRunner};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::adb_tcp::{AdbTcp, DEFAULT_SHORT_CMD_TIMEOUT, RETRY_INTERVAL};
use crate::artifacts::{fetch_common_files, fetch_tombstones, log_remote_command_output, ssh_bugreport};
use crate::config::DeviceOptions;
use crate::connection::{ConnectionBase, DeviceConnection};
use crate::device::{DeviceHandle, DeviceState, ManagedDevice, RecoveryMode};
use crate::diagnostics::{convert_error_signature, inspect_host};
use crate::error::{ConnectionError, ConnectionResult, ErrorId};
use crate::instance::{HostAndPort, VmInstanceInfo, VmStatus};
use crate::launcher::{LaunchRequest, LauncherFactory, VmLauncher};
use crate::remote::{is_reachable_by_ssh, run_remote_command};
use crate::snapshot::SnapshotTarget;
use crate::tcp::TcpConnection;
use crate::tunnel::{TunnelMonitor, TunnelRequest, TunnelSpawner};

pub const WAIT_TIME_DIVISION: u32 = 4;
pub const WAIT_FOR_DEVICE_ONLINE: Duration = Duration::from_secs(60);
pub const WAIT_FOR_TUNNEL_OFFLINE: Duration = Duration::from_secs(5);
pub const WAIT_FOR_TUNNEL_ONLINE: Duration = Duration::from_secs(2 * 60);
pub const WAIT_FOR_ADB_CONNECT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_LONG_CMD_TIMEOUT: Duration = Duration::from_secs(60);

const POWERWASH_MIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SNAPSHOT_MIN_TIMEOUT: Duration = Duration::from_secs(30);
const POWERWASH_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FIND_BINARY_TIMEOUT: Duration = Duration::from_secs(10);
const NO_SPACE_MARKER: &str = "Not enough space remaining in fs containing";

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// The launched virtual device and the host commands that act on it. Shared with
/// the snapshot feature, hence the interior lock around the descriptor.
pub struct RemoteVm {
    runner: Arc<dyn CommandRunner>,
    device: Arc<dyn ManagedDevice>,
    options: DeviceOptions,
    metrics: InvocationMetrics,
    adb: Arc<AdbTcp>,
    instance: Mutex<Option<VmInstanceInfo>>,
}

impl RemoteVm {
    fn new(base: &ConnectionBase, adb: Arc<AdbTcp>, instance: Option<VmInstanceInfo>) -> Self {
        Self {
            runner: Arc::clone(base.runner()),
            device: Arc::clone(base.device()),
            options: base.options().clone(),
            metrics: base.metrics().clone(),
            adb,
            instance: Mutex::new(instance),
        }
    }

    pub fn instance(&self) -> Option<VmInstanceInfo> {
        self.instance.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_instance(&self, instance: Option<VmInstanceInfo>) {
        if let Ok(mut guard) = self.instance.lock() {
            *guard = instance;
        }
    }

    fn mark_offline(&self) {
        if let Ok(mut guard) = self.instance.lock() {
            if let Some(instance) = guard.as_mut() {
                if instance.status == VmStatus::Success {
                    instance.status = VmStatus::DeviceOffline;
                }
            }
        }
    }

    fn require_instance(&self) -> ConnectionResult<VmInstanceInfo> {
        self.instance().ok_or_else(|| {
            ConnectionError::setup(
                "Can not get GCE AVD Info. launch GCE first?",
                self.device.serial(),
                ErrorId::DeviceUnavailable,
            )
        })
    }

    fn user<'a>(&'a self, user: Option<&'a str>) -> &'a str {
        user.unwrap_or(&self.options.instance_user)
    }

    async fn remote(&self, instance: &VmInstanceInfo, timeout: Duration, command: &str) -> CommandResult {
        let argv: Vec<&str> = command.split_whitespace().collect();
        run_remote_command(instance, &self.options, self.runner.as_ref(), timeout, &argv).await
    }

    /// Host command line for a Cuttlefish binary. `None` when the binary could
    /// not be located on an Oxygen host.
    pub async fn command_builder(
        &self,
        instance: &VmInstanceInfo,
        bin: &str,
        args: &str,
        user: &str,
        offset: Option<u32>,
    ) -> Option<String> {
        if self.options.use_oxygen {
            let found = self
                .remote(instance, FIND_BINARY_TIMEOUT, &format!("toybox find /tmp -name {bin}"))
                .await;
            if !found.is_success() {
                error!("failed to locate {bin}: {}", found.stderr.trim());
                return None;
            }
            let Some(path) = found.stdout.lines().map(str::trim).find(|line| !line.is_empty())
            else {
                error!("{bin} not found under /tmp on the host");
                return None;
            };
            let home = path.strip_suffix(&format!("/bin/{bin}")).unwrap_or(path);
            return Some(format!("HOME={home} {path} {args}"));
        }
        Some(match offset {
            Some(offset) => {
                let num = offset + 1;
                format!(
                    "HOME=/home/{user}/acloud_cf_{num} acloud_cf_{num}/bin/{bin} {args} -instance_num {num}"
                )
            }
            None => format!("/home/{user}/bin/{bin} {args}"),
        })
    }

    pub async fn powerwash_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
    ) -> ConnectionResult<CommandResult> {
        let start = Instant::now();
        let instance = self.require_instance()?;
        let user = self.user(user);
        let Some(command) = self
            .command_builder(&instance, "powerwash_cvd", "", user, offset)
            .await
        else {
            return Ok(CommandResult::exception("powerwash_cvd not found on host"));
        };
        let result = self
            .remote(
                &instance,
                POWERWASH_MIN_TIMEOUT.max(self.options.gce_cmd_timeout()),
                &command,
            )
            .await;
        self.metrics
            .push(MetricKey::PowerwashTime, millis(start.elapsed()));
        if !result.is_success() {
            self.metrics.increment(MetricKey::PowerwashFailureCount);
            error!("powerwash failed: {}", result.stderr.trim());
            let devices = self
                .runner
                .run_timed_cmd(DEFAULT_LONG_CMD_TIMEOUT, &[self.adb.adb(), "devices"])
                .await;
            error!("{}", devices.log_text());
            return Ok(result);
        }
        self.metrics.increment(MetricKey::PowerwashSuccessCount);
        if !self
            .device
            .wait_for_device_available(POWERWASH_AVAILABLE_TIMEOUT)
            .await
        {
            warn!("device {} not available after powerwash", self.device.serial());
        }
        Ok(result)
    }

    pub async fn snapshot_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        let instance = self.require_instance()?;
        let serial = self.device.serial();
        let user = self.user(user);
        let args = format!(
            "--subcmd=snapshot_take --force --auto_suspend --snapshot_path=/tmp/{user}/snapshots/{snapshot_id}"
        );
        let Some(command) = self
            .command_builder(&instance, "snapshot_util_cvd", &args, user, offset)
            .await
        else {
            return Err(ConnectionError::setup(
                "failed to set up snapshot command, invalid path",
                serial,
                ErrorId::DeviceFailedToSnapshot,
            ));
        };
        let result = self
            .remote(
                &instance,
                SNAPSHOT_MIN_TIMEOUT.max(self.options.gce_cmd_timeout()),
                &command,
            )
            .await;
        if !result.is_success() {
            self.metrics.increment(MetricKey::DeviceSnapshotFailureCount);
            error!("snapshot failed: {}", result.stderr.trim());
            return Err(ConnectionError::setup(
                format!("failed to snapshot device: {}", result.stderr.trim()),
                serial,
                ErrorId::DeviceFailedToSnapshot,
            ));
        }
        Ok(result)
    }

    pub async fn restore_snapshot_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.stop_gce(user, offset).await?;
        let instance = self.require_instance()?;
        let serial = self.device.serial();
        let user = self.user(user);
        let args = format!("--snapshot_path=/tmp/{user}/snapshots/{snapshot_id}");
        let Some(command) = self
            .command_builder(&instance, "launch_cvd", &args, user, offset)
            .await
        else {
            return Err(ConnectionError::setup(
                "failed to set up restore command, invalid path",
                serial,
                ErrorId::DeviceFailedToRestoreSnapshot,
            ));
        };
        let result = self
            .remote(
                &instance,
                POWERWASH_MIN_TIMEOUT.max(self.options.gce_cmd_timeout()),
                &command,
            )
            .await;
        if !result.is_success() {
            self.metrics
                .increment(MetricKey::DeviceSnapshotRestoreFailureCount);
            error!("restore failed: {}", result.stderr.trim());
            let id = if result.stderr.contains(NO_SPACE_MARKER) {
                ErrorId::NoDiskSpace
            } else {
                ErrorId::DeviceFailedToRestoreSnapshot
            };
            return Err(ConnectionError::setup(
                format!("failed to restore device: {}", result.stderr.trim()),
                serial,
                id,
            ));
        }
        let ready = async {
            self.adb.wait_for_connect(&serial, WAIT_FOR_ADB_CONNECT).await?;
            self.device.wait_for_device_online(WAIT_FOR_DEVICE_ONLINE).await
        };
        if let Err(err) = ready.await {
            error!("device did not come back after restore: {err}");
            return Err(ConnectionError::setup(
                format!("failed to restore device: {err}"),
                serial,
                ErrorId::DeviceFailedToRestoreSnapshot,
            ));
        }
        Ok(result)
    }

    pub async fn delete_snapshot_gce(
        &self,
        user: Option<&str>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        let instance = self.require_instance()?;
        let user = self.user(user);
        let result = self
            .remote(
                &instance,
                SNAPSHOT_MIN_TIMEOUT.max(self.options.gce_cmd_timeout()),
                &format!("rm -rf /tmp/{user}/snapshots/{snapshot_id}"),
            )
            .await;
        if !result.is_success() {
            error!("deleting snapshot {snapshot_id} failed: {}", result.stderr.trim());
            return Err(ConnectionError::setup(
                format!("failed to delete snapshot {snapshot_id}: {}", result.stderr.trim()),
                self.device.serial(),
                ErrorId::DeviceFailedToDeleteSnapshot,
            ));
        }
        Ok(result)
    }

    async fn stop_gce(&self, user: Option<&str>, offset: Option<u32>) -> ConnectionResult<()> {
        let start = Instant::now();
        let instance = self.require_instance()?;
        let serial = self.device.serial();
        let user = self.user(user);
        let Some(command) = self
            .command_builder(&instance, "stop_cvd", "", user, offset)
            .await
        else {
            return Err(ConnectionError::setup(
                "failed to set up stop command, invalid path",
                serial,
                ErrorId::DeviceFailedToStop,
            ));
        };
        let result = self
            .remote(
                &instance,
                POWERWASH_MIN_TIMEOUT.max(self.options.gce_cmd_timeout()),
                &command,
            )
            .await;
        if !result.is_success() {
            self.metrics.increment(MetricKey::DeviceStopFailureCount);
            error!("stop failed: {}", result.stderr.trim());
            return Err(ConnectionError::setup(
                "failed to stop device",
                serial,
                ErrorId::DeviceFailedToStop,
            ));
        }
        self.metrics
            .push(MetricKey::DeviceStopDurations, millis(start.elapsed()));
        self.metrics.increment(MetricKey::DeviceStopSuccessCount);
        Ok(())
    }
}

#[async_trait]
impl SnapshotTarget for RemoteVm {
    fn serial(&self) -> String {
        self.device.serial()
    }

    fn instance(&self) -> Option<VmInstanceInfo> {
        RemoteVm::instance(self)
    }

    async fn snapshot(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.snapshot_gce(user, offset, snapshot_id).await
    }

    async fn restore_snapshot(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.restore_snapshot_gce(user, offset, snapshot_id).await
    }
}

/// Turns device recovery off until dropped, then puts the previous mode back,
/// including when the owning future is cancelled.
struct RecoveryModeGuard {
    device: Arc<dyn ManagedDevice>,
    previous: RecoveryMode,
}

impl RecoveryModeGuard {
    fn suspend(device: Arc<dyn ManagedDevice>) -> Self {
        let previous = device.recovery_mode();
        device.set_recovery_mode(RecoveryMode::None);
        Self { device, previous }
    }
}

impl Drop for RecoveryModeGuard {
    fn drop(&mut self) {
        self.device.set_recovery_mode(self.previous);
    }
}

pub struct SshConnection {
    tcp: TcpConnection,
    vm: Arc<RemoteVm>,
    launcher_factory: LauncherFactory,
    launcher: Option<Arc<dyn VmLauncher>>,
    spawner: Arc<dyn TunnelSpawner>,
    monitor: Option<TunnelMonitor>,
    tunnel_init_failed: Option<ConnectionError>,
    startup_permits: Option<Arc<Semaphore>>,
    is_remote: bool,
    known_ip: Option<String>,
}

impl SshConnection {
    pub fn new(
        base: ConnectionBase,
        existing_instance: Option<VmInstanceInfo>,
        launcher_factory: LauncherFactory,
        spawner: Arc<dyn TunnelSpawner>,
        startup_permits: Option<Arc<Semaphore>>,
    ) -> Self {
        let tcp = TcpConnection::new(base);
        let vm = Arc::new(RemoteVm::new(
            tcp.base(),
            Arc::clone(tcp.adb()),
            existing_instance,
        ));
        Self {
            tcp,
            vm,
            launcher_factory,
            launcher: None,
            spawner,
            monitor: None,
            tunnel_init_failed: None,
            startup_permits,
            is_remote: false,
            known_ip: None,
        }
    }

    pub fn base(&self) -> &ConnectionBase {
        self.tcp.base()
    }

    pub fn tcp(&self) -> &TcpConnection {
        &self.tcp
    }

    /// Descriptor of the launched device, whatever its status.
    pub fn instance(&self) -> Option<VmInstanceInfo> {
        self.vm.instance()
    }

    pub fn tunnel_monitor(&self) -> Option<&TunnelMonitor> {
        self.monitor.as_ref()
    }

    pub fn snapshot_target(&self) -> Arc<dyn SnapshotTarget> {
        Arc::clone(&self.vm) as Arc<dyn SnapshotTarget>
    }

    pub async fn powerwash(&self) -> ConnectionResult<CommandResult> {
        self.vm.powerwash_gce(None, None).await
    }

    pub async fn powerwash_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
    ) -> ConnectionResult<CommandResult> {
        self.vm.powerwash_gce(user, offset).await
    }

    pub async fn snapshot_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.vm.snapshot_gce(user, offset, snapshot_id).await
    }

    pub async fn restore_snapshot_gce(
        &self,
        user: Option<&str>,
        offset: Option<u32>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.vm.restore_snapshot_gce(user, offset, snapshot_id).await
    }

    pub async fn delete_snapshot_gce(
        &self,
        user: Option<&str>,
        snapshot_id: &str,
    ) -> ConnectionResult<CommandResult> {
        self.vm.delete_snapshot_gce(user, snapshot_id).await
    }

    fn serial(&self) -> String {
        self.base().device().serial()
    }

    async fn acquire_startup_permit(&self, queued_at: Instant) -> Option<OwnedSemaphorePermit> {
        let permits = self.startup_permits.clone()?;
        match permits.acquire_owned().await {
            Ok(permit) => {
                let queued = queued_at.elapsed();
                debug!(
                    "virtual device startup permit obtained after {}s",
                    queued.as_secs()
                );
                self.base()
                    .metrics()
                    .add(MetricKey::VirtualDeviceStartupQueueTime, millis(queued));
                Some(permit)
            }
            Err(_) => {
                warn!("startup permit pool is closed, launching without a permit");
                None
            }
        }
    }

    async fn launch_gce(&mut self, launcher: &Arc<dyn VmLauncher>) -> ConnectionResult<()> {
        let base = self.tcp.base();
        let options = base.options();
        let request = LaunchRequest {
            build: base.build_info().clone(),
            initial_ip: base.initial_ip().map(str::to_string),
            initial_user: base.initial_user().map(str::to_string),
            offset: base.initial_offset(),
            attributes: base.attributes().clone(),
        };
        let attempts = options.gce_max_attempt.max(1);
        let mut last_error = None;
        let mut launched = None;
        for attempt in 1..=attempts {
            match launcher.launch(&request, base.logger()).await {
                Ok(instance) => {
                    let success = instance.status == VmStatus::Success;
                    if !success {
                        warn!(
                            "failed to start virtual device with attempt {attempt} out of {attempts}, error: {}",
                            instance.errors
                        );
                    }
                    launched = Some(instance);
                    if success {
                        break;
                    }
                }
                Err(err) => {
                    warn!("failed to start virtual device with attempt {attempt} out of {attempts}: {err}");
                    launcher
                        .download_launch_failure_logs(&err, base.logger())
                        .await;
                    last_error = Some(err);
                }
            }
        }

        let serial = self.serial();
        let Some(instance) = launched else {
            let err = last_error.unwrap_or_else(|| {
                ConnectionError::setup(
                    "virtual device launcher returned nothing",
                    serial.clone(),
                    ErrorId::FailedToLaunchGce,
                )
            });
            return Err(self.classify_launch_failure(err, None).await);
        };
        info!("virtual device has been started: {}", instance.instance_name);
        self.vm.set_instance(Some(instance.clone()));

        let id = instance
            .error_type
            .or_else(|| {
                instance
                    .error_signature
                    .as_deref()
                    .and_then(convert_error_signature)
            })
            .unwrap_or(ErrorId::FailedToLaunchGce);
        let failure = match instance.status {
            VmStatus::BootFail => Some(ConnectionError::setup(
                format!(
                    "Device failed to boot. Error from device leasing attempt: {}",
                    instance.errors
                ),
                serial,
                id,
            )),
            VmStatus::Fail => Some(ConnectionError::setup(instance.errors.clone(), serial, id)),
            _ => None,
        };
        if let Some(err) = failure {
            return Err(self.classify_launch_failure(err, Some(&instance)).await);
        }
        self.create_tunnel_monitor(&instance);
        Ok(())
    }

    /// Refines a generic launch failure with what the host itself reports.
    async fn classify_launch_failure(
        &self,
        err: ConnectionError,
        instance: Option<&VmInstanceInfo>,
    ) -> ConnectionError {
        let options = self.base().options();
        if !options.inspect_host_on_launch_failure
            || !matches!(err.id(), ErrorId::FailedToLaunchGce | ErrorId::Undetermined)
        {
            return err;
        }
        let target = match instance {
            Some(instance) => instance.clone(),
            None => match self.base().initial_ip() {
                Some(ip) => VmInstanceInfo::new(
                    ip,
                    HostAndPort::new(ip, options.remote_adb_port),
                    VmStatus::Fail,
                ),
                None => return err,
            },
        };
        match inspect_host(&target, options, self.base().runner().as_ref()).await {
            Some(found) => {
                warn!("launch failure classified as {}: {}", found.id, found.detail);
                err.with_id(found.id)
            }
            None => err,
        }
    }

    fn create_tunnel_monitor(&mut self, instance: &VmInstanceInfo) {
        let Some(host_and_port) = instance.host_and_port.clone() else {
            warn!(
                "instance {} has no host, not creating a tunnel",
                instance.instance_name
            );
            return;
        };
        let local_port = match free_local_port() {
            Ok(port) => port,
            Err(err) => {
                error!("no free local port for the tunnel: {err}");
                return;
            }
        };
        let options = self.base().options();
        let request = TunnelRequest {
            local_port,
            remote_host: host_and_port.host,
            remote_port: host_and_port.port,
            user: instance.user_or(&options.instance_user).to_string(),
            ssh_key: options.ssh_key(),
            log_path: None,
        };
        let mut monitor = TunnelMonitor::new(
            request,
            Arc::clone(&self.spawner),
            Arc::clone(self.tcp.adb()),
            Arc::clone(self.base().device()),
        );
        monitor.start();
        debug!("tunnel monitor started on {}", monitor.serial());
        self.monitor = Some(monitor);
    }

    pub async fn wait_for_tunnel_online(&mut self, wait: Duration) -> ConnectionResult<()> {
        info!("waiting {}ms for the tunnel to be online", wait.as_millis());
        let start = Instant::now();
        while start.elapsed() < wait {
            match &self.monitor {
                None => {
                    error!("tunnel monitor is gone, something went wrong with the device");
                    break;
                }
                Some(monitor) if monitor.is_finished() => {
                    error!("tunnel monitor task ended, something went wrong with the device");
                    break;
                }
                Some(monitor) if monitor.is_tunnel_alive() => {
                    debug!("tunnel online, resuming");
                    return Ok(());
                }
                Some(_) => {}
            }
            self.base().runner().sleep(RETRY_INTERVAL).await;
        }
        let err = ConnectionError::not_available(
            format!("Tunnel did not come back online after {}ms", wait.as_millis()),
            self.serial(),
            ErrorId::FailedToConnectToGce,
        );
        self.tunnel_init_failed = Some(err.clone());
        Err(err)
    }

    async fn wait_for_boot(&mut self, remaining: Duration) -> ConnectionResult<bool> {
        let slice = remaining / WAIT_TIME_DIVISION;
        let device = Arc::clone(self.base().device());
        for _ in 0..WAIT_TIME_DIVISION {
            if device.wait_for_device_available(slice).await {
                return Ok(true);
            }
            self.wait_for_tunnel_online(WAIT_FOR_TUNNEL_ONLINE).await?;
            self.tcp
                .wait_for_adb_connect(&device.serial(), WAIT_FOR_ADB_CONNECT)
                .await?;
        }
        Ok(false)
    }

    async fn verify_kernel(&self) -> ConnectionResult<()> {
        let Some(expected) = self.base().options().requested_kernel_build_id() else {
            return Ok(());
        };
        let output = self
            .base()
            .device()
            .execute_shell_command("uname -r")
            .await?;
        let output = output.trim();
        if output.is_empty() {
            warn!("failed to get kernel information by `uname -r` from device");
            return Ok(());
        }
        if !output.contains(expected) {
            return Err(ConnectionError::setup(
                format!(
                    "Device booted up with wrong kernel {output}, expecting kernel build ID {expected}"
                ),
                self.serial(),
                ErrorId::DeviceUnexpectedResponse,
            ));
        }
        info!("device has the expected kernel build ID {expected} in {output}");
        Ok(())
    }

    async fn recover_tunnel(&mut self, serial: &str) -> ConnectionResult<()> {
        info!("attempting recovery on virtual device {serial}");
        if let Some(monitor) = &self.monitor {
            monitor.close_connection();
        }
        self.base().runner().sleep(WAIT_FOR_TUNNEL_OFFLINE).await;
        self.wait_for_tunnel_online(WAIT_FOR_TUNNEL_ONLINE).await?;
        self.tcp
            .wait_for_adb_connect(serial, WAIT_FOR_ADB_CONNECT)
            .await
    }

    async fn collect_logs(&self, instance: &VmInstanceInfo) {
        if instance.skip_log_collection {
            debug!("device log collection is skipped for {}", instance.instance_name);
            return;
        }
        if instance.host_and_port.is_none() {
            return;
        }
        let base = self.base();
        let (logger, options, runner) = (base.logger(), base.options(), base.runner().as_ref());
        if instance.status != VmStatus::Success {
            ssh_bugreport(logger, instance, options, runner).await;
        }
        if let Some(launcher) = &self.launcher {
            launcher.log_serial_output(instance, logger).await;
        }
        if is_reachable_by_ssh(instance, options, runner).await {
            fetch_common_files(logger, instance, options, runner).await;
            fetch_tombstones(logger, instance, options, runner).await;
        } else {
            error!("failed to establish ssh connection to the host, skipping remote file and tombstone collection");
        }
        if options.use_oxygen {
            log_remote_command_output(
                logger,
                instance,
                options,
                runner,
                "host_kernel.log",
                &["toybox", "dmesg"],
            )
            .await;
        }
    }

    fn restore_placeholder(&self) {
        let base = self.base();
        let handle = if base.was_temporary_holder() {
            DeviceHandle::Placeholder {
                serial: base.initial_serial().to_string(),
                temporary: true,
            }
        } else if self.is_remote {
            DeviceHandle::VmRemote {
                serial: base.initial_serial().to_string(),
                known_ip: self.known_ip.clone(),
            }
        } else {
            base.initial_remote_avd_handle()
        };
        debug!("releasing device as {handle:?}");
        base.device().set_device_handle(handle);
    }

    fn event(&self, kind: &str, outcome: &str) {
        devlink_telemetry::event(kind, self.base().initial_serial(), outcome);
    }
}

#[async_trait]
impl DeviceConnection for SshConnection {
    async fn initialize_connection(&mut self) -> ConnectionResult<()> {
        self.monitor = None;
        self.tunnel_init_failed = None;
        let launcher = (self.launcher_factory)();
        self.launcher = Some(Arc::clone(&launcher));
        if let DeviceHandle::VmRemote { known_ip, .. } = self.base().device().device_handle() {
            self.is_remote = true;
            self.known_ip = known_ip;
        }

        let budget = self.base().options().gce_cmd_timeout();
        let mut remaining = budget;
        if let Some(instance) = self.vm.instance() {
            debug!(
                "skipped virtual device launch, instance {} is already set",
                instance.instance_name
            );
            self.create_tunnel_monitor(&instance);
        } else {
            let start = Instant::now();
            let launched = {
                let _permit = self.acquire_startup_permit(start).await;
                self.launch_gce(&launcher).await
            };
            self.base()
                .metrics()
                .push(MetricKey::VirtualDeviceLaunchTime, millis(start.elapsed()));
            if let Err(err) = launched {
                self.event("connection.launch", "failed");
                return Err(err);
            }
            remaining = budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(ConnectionError::not_available(
                    format!("Failed to launch GCE after {}ms", budget.as_millis()),
                    self.serial(),
                    ErrorId::FailedToLaunchGce,
                ));
            }
            debug!("{}ms left before timeout after launch returned", remaining.as_millis());
        }

        let device = Arc::clone(self.base().device());
        let booted = {
            let _mode = RecoveryModeGuard::suspend(Arc::clone(&device));
            self.wait_for_boot(remaining).await
        };
        let unresponsive = !booted?;

        let state = device.state();
        if state != DeviceState::Online || unresponsive {
            self.vm.mark_offline();
            self.event("connection.initialize", "offline");
            if unresponsive {
                return Err(ConnectionError::unresponsive(
                    "AVD device booted to online but is unresponsive.",
                    device.serial(),
                    ErrorId::DeviceUnresponsive,
                ));
            }
            return Err(ConnectionError::not_available(
                format!("AVD device booted but was in {} state", state.as_str()),
                device.serial(),
                ErrorId::FailedToLaunchGce,
            ));
        }
        self.verify_kernel().await?;
        device.enable_adb_root().await?;
        if self.base().options().logcat_capture_enabled {
            device.start_logcat().await;
        }
        self.event("connection.initialize", "ok");
        Ok(())
    }

    async fn reconnect(&mut self, serial: &str) -> ConnectionResult<()> {
        let tunnel_alive = self
            .monitor
            .as_ref()
            .is_some_and(TunnelMonitor::is_tunnel_alive);
        if !tunnel_alive {
            if let Some(monitor) = &self.monitor {
                monitor.close_connection();
            }
            self.base().runner().sleep(WAIT_FOR_TUNNEL_OFFLINE).await;
            self.wait_for_tunnel_online(WAIT_FOR_TUNNEL_ONLINE).await?;
        }
        self.tcp.reconnect(serial).await
    }

    async fn reconnect_for_recovery(&mut self, serial: &str) -> ConnectionResult<()> {
        if self.monitor.is_none() {
            if let Some(err) = &self.tunnel_init_failed {
                return Err(err.clone());
            }
            self.wait_for_tunnel_online(WAIT_FOR_TUNNEL_ONLINE).await?;
        }
        let probe = self.base().options().recovery_probe_timeout();
        if self.base().device().wait_for_device_shell(probe).await {
            return Ok(());
        }
        let start = Instant::now();
        let outcome = self.recover_tunnel(serial).await;
        let metrics = self.base().metrics();
        match &outcome {
            Ok(()) => metrics.increment(MetricKey::DeviceRecoveredFromSshTunnel),
            Err(_) => metrics.increment(MetricKey::RecoveryRoutineCount),
        }
        metrics.add(MetricKey::RecoveryTime, millis(start.elapsed()));
        self.event(
            "connection.recovery",
            if outcome.is_ok() { "ok" } else { "failed" },
        );
        outcome
    }

    fn notify_adb_reboot_called(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.set_adb_reboot_called(true);
        }
    }

    async fn tear_down_connection(&mut self) {
        let device = Arc::clone(self.base().device());
        info!("tear down for device {}", device.serial());
        device.clear_logcat().await;
        device.stop_logcat().await;

        if let Some(mut monitor) = self.monitor.take() {
            monitor.log_tunnel_logs(self.tcp.base().logger());
            monitor.shutdown();
            monitor.join(DEFAULT_LONG_CMD_TIMEOUT).await;
        }
        if !device
            .wait_for_device_not_available(DEFAULT_SHORT_CMD_TIMEOUT)
            .await
        {
            warn!("device {} still available after timeout", device.serial());
        }

        if let Some(instance) = self.vm.instance() {
            self.collect_logs(&instance).await;
            if self.base().options().skip_tear_down {
                info!("skipping shutdown of {}", instance.instance_name);
            } else if let Some(launcher) = &self.launcher {
                if !launcher.shutdown(&instance).await {
                    warn!("shutdown of {} was not confirmed", instance.instance_name);
                }
            }
        }
        self.vm.set_instance(None);
        self.restore_placeholder();

        if let Some(launcher) = &self.launcher {
            launcher.clean_up().await;
        }
        self.tcp.tear_down_connection().await;
    }

    async fn recover_virtual_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: Option<&str>,
        error: ConnectionError,
    ) -> ConnectionResult<()> {
        self.tcp
            .recover_virtual_device(device, snapshot_id, error)
            .await
    }

    async fn snapshot_device(
        &self,
        device: &dyn ManagedDevice,
        snapshot_id: &str,
    ) -> ConnectionResult<()> {
        self.tcp.snapshot_device(device, snapshot_id).await
    }
}
