//! Background task keeping an ssh port-forward to a remote device's adb port.

use std::{
    fs::OpenOptions,
    io,
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::{
    process::{Child, Command},
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::adb_tcp::AdbTcp;
use crate::device::{DeviceHandle, ManagedDevice};
use crate::logger::{LogDataType, TestLogger};
use crate::remote::SSH_OPTIONS;

pub const WAIT_FOR_FIRST_CONNECT: Duration = Duration::from_secs(10);
pub const WAIT_AFTER_REBOOT: Duration = Duration::from_secs(60);
pub const TUNNEL_KILL_TIMEOUT: Duration = Duration::from_secs(20);

const LOCAL_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub user: String,
    pub ssh_key: Option<String>,
    pub log_path: Option<PathBuf>,
}

#[async_trait]
pub trait TunnelProcess: Send {
    fn is_alive(&mut self) -> bool;
    /// Resolves once the process has exited.
    async fn wait(&mut self);
    /// Kills the process and waits up to `timeout` for it to exit.
    async fn kill(&mut self, timeout: Duration) -> bool;
}

#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    async fn spawn(&self, request: &TunnelRequest) -> io::Result<Box<dyn TunnelProcess>>;
}

/// Opens tunnels with `ssh -N -L`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTunnelSpawner;

pub fn ssh_tunnel_args(request: &TunnelRequest) -> Vec<String> {
    let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
    if let Some(key) = &request.ssh_key {
        args.push("-i".into());
        args.push(key.clone());
    }
    args.push("-N".into());
    args.push("-L".into());
    args.push(format!(
        "{}:127.0.0.1:{}",
        request.local_port, request.remote_port
    ));
    args.push(format!("{}@{}", request.user, request.remote_host));
    args
}

#[async_trait]
impl TunnelSpawner for SshTunnelSpawner {
    async fn spawn(&self, request: &TunnelRequest) -> io::Result<Box<dyn TunnelProcess>> {
        let stderr = match &request.log_path {
            Some(path) => Stdio::from(OpenOptions::new().create(true).append(true).open(path)?),
            None => Stdio::null(),
        };
        let child = Command::new("ssh")
            .args(ssh_tunnel_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildTunnel { child }))
    }
}

struct ChildTunnel {
    child: Child,
}

#[async_trait]
impl TunnelProcess for ChildTunnel {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) {
        let _ = self.child.wait().await;
    }

    async fn kill(&mut self, timeout: Duration) -> bool {
        let _ = self.child.start_kill();
        tokio::time::timeout(timeout, self.child.wait()).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    NotCreated,
    Alive,
    Dead,
}

#[derive(Default)]
struct TunnelShared {
    created: AtomicBool,
    alive: AtomicBool,
    reboot_called: AtomicBool,
    /// Bumped each time a tunnel finishes its adb connect.
    generation: AtomicU64,
    /// Generation a pending close request was made against.
    close_target: AtomicU64,
}

pub struct TunnelMonitor {
    shared: Arc<TunnelShared>,
    serial: String,
    adb: Arc<AdbTcp>,
    shutdown_tx: watch::Sender<bool>,
    close: Arc<Notify>,
    pending: Option<MonitorTask>,
    handle: Option<JoinHandle<()>>,
    adb_log: Option<NamedTempFile>,
    tunnel_log: Option<NamedTempFile>,
}

impl TunnelMonitor {
    pub fn new(
        mut request: TunnelRequest,
        spawner: Arc<dyn TunnelSpawner>,
        adb: Arc<AdbTcp>,
        device: Arc<dyn ManagedDevice>,
    ) -> Self {
        let adb_log = temp_log("adb-connection");
        let tunnel_log = temp_log("ssh-tunnel");
        if let Some(log) = &adb_log {
            adb.set_connect_log(Some(log.path().to_path_buf()));
        }
        if request.log_path.is_none() {
            request.log_path = tunnel_log.as_ref().map(|log| log.path().to_path_buf());
        }
        let serial = format!("{LOCAL_HOST}:{}", request.local_port);
        let shared = Arc::new(TunnelShared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let close = Arc::new(Notify::new());
        let pending = MonitorTask {
            shared: Arc::clone(&shared),
            request,
            spawner,
            adb: Arc::clone(&adb),
            device,
            serial: serial.clone(),
            shutdown_rx,
            close: Arc::clone(&close),
        };
        Self {
            shared,
            serial,
            adb,
            shutdown_tx,
            close,
            pending: Some(pending),
            handle: None,
            adb_log,
            tunnel_log,
        }
    }

    /// Spawns the monitor task. Later calls are no-ops.
    pub fn start(&mut self) {
        if let Some(task) = self.pending.take() {
            self.handle = Some(tokio::spawn(task.run()));
        }
    }

    /// Local adb serial the tunnel exposes.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_tunnel_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TunnelState {
        if !self.shared.created.load(Ordering::Acquire) {
            TunnelState::NotCreated
        } else if self.is_tunnel_alive() {
            TunnelState::Alive
        } else {
            TunnelState::Dead
        }
    }

    /// True once the task has exited, whether by shutdown or because it could
    /// not create a tunnel.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Asks the task to drop the current tunnel; it opens a new one afterwards.
    /// A request made before the tunnel finished connecting does not carry
    /// over to the next one.
    pub fn close_connection(&self) {
        let current = self.shared.generation.load(Ordering::Acquire);
        self.shared.close_target.store(current, Ordering::Release);
        self.close.notify_one();
    }

    pub fn set_adb_reboot_called(&self, called: bool) {
        self.shared.reboot_called.store(called, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Waits for the task to exit. On timeout the task is left to finish on its
    /// own and false is returned.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => {
                self.handle = None;
                true
            }
            Err(_) => {
                warn!(
                    "tunnel monitor for {} did not stop within {}ms, abandoning it",
                    self.serial,
                    timeout.as_millis()
                );
                false
            }
        }
    }

    pub fn log_tunnel_logs(&mut self, logger: &dyn TestLogger) {
        self.adb.set_connect_log(None);
        if let Some(log) = self.adb_log.take() {
            log_if_not_empty(logger, "adb-connect-logs", log);
        }
        if let Some(log) = self.tunnel_log.take() {
            log_if_not_empty(logger, "ssh-tunnel-logs", log);
        }
    }
}

impl Drop for TunnelMonitor {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

fn temp_log(prefix: &str) -> Option<NamedTempFile> {
    match tempfile::Builder::new().prefix(prefix).suffix(".txt").tempfile() {
        Ok(file) => Some(file),
        Err(err) => {
            error!("cannot create {prefix} log: {err}");
            None
        }
    }
}

fn log_if_not_empty(logger: &dyn TestLogger, name: &str, log: NamedTempFile) {
    let size = log.as_file().metadata().map(|meta| meta.len()).unwrap_or(0);
    if size > 0 {
        logger.test_log(name, LogDataType::Text, log.path());
    }
}

struct MonitorTask {
    shared: Arc<TunnelShared>,
    request: TunnelRequest,
    spawner: Arc<dyn TunnelSpawner>,
    adb: Arc<AdbTcp>,
    device: Arc<dyn ManagedDevice>,
    serial: String,
    shutdown_rx: watch::Receiver<bool>,
    close: Arc<Notify>,
}

impl MonitorTask {
    async fn run(mut self) {
        debug!(
            "setting device {} serial to {}",
            self.device.serial(),
            self.serial
        );
        self.device.set_device_handle(DeviceHandle::RemoteAvd {
            serial: self.serial.clone(),
            known_ip: None,
            user: None,
            offset: None,
        });
        let port = self.request.local_port.to_string();

        while !self.shutdown_requested() {
            let mut process = match self.spawner.spawn(&self.request).await {
                Ok(process) => process,
                Err(err) => {
                    error!(
                        "failed creating the tunnel to {}: {err}",
                        self.request.remote_host
                    );
                    break;
                }
            };
            self.shared.created.store(true, Ordering::Release);

            if !self.pause(WAIT_FOR_FIRST_CONNECT).await {
                process.kill(TUNNEL_KILL_TIMEOUT).await;
                break;
            }
            if !process.is_alive() {
                warn!("tunnel to {} exited before adb connect", self.request.remote_host);
                continue;
            }
            self.shared.alive.store(true, Ordering::Release);
            if !self.adb.connect(LOCAL_HOST, &port).await {
                error!("adb connect failed, re-creating the tunnel");
                self.close_tunnel(process.as_mut(), &port).await;
                continue;
            }

            let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            loop {
                tokio::select! {
                    _ = process.wait() => {
                        info!("tunnel to {} exited", self.request.remote_host);
                        break;
                    }
                    _ = self.close.notified() => {
                        if self.shared.close_target.load(Ordering::Acquire) == generation {
                            debug!("tunnel close requested");
                            break;
                        }
                        debug!("ignoring close request made for an earlier tunnel");
                    }
                    _ = self.shutdown_rx.changed() => {
                        debug!("tunnel shutdown requested");
                        break;
                    }
                }
            }
            self.close_tunnel(process.as_mut(), &port).await;

            if self.shared.reboot_called.swap(false, Ordering::AcqRel) {
                info!("adb reboot was called, waiting before re-creating the tunnel");
                if !self.pause(WAIT_AFTER_REBOOT).await {
                    break;
                }
            }
        }
        self.shared.alive.store(false, Ordering::Release);
    }

    async fn close_tunnel(&self, process: &mut dyn TunnelProcess, port: &str) {
        self.shared.alive.store(false, Ordering::Release);
        self.adb.disconnect(LOCAL_HOST, port).await;
        if !process.kill(TUNNEL_KILL_TIMEOUT).await {
            warn!("tunnel process did not exit after kill");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleeps unless shutdown arrives first. Returns false on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.shutdown_requested(),
            _ = self.shutdown_rx.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_tunnel_forwards_local_port() {
        let args = ssh_tunnel_args(&TunnelRequest {
            local_port: 41234,
            remote_host: "10.0.0.9".into(),
            remote_port: 6521,
            user: "vsoc-01".into(),
            ssh_key: Some("/k".into()),
            log_path: None,
        });
        let line = args.join(" ");
        assert!(line.contains("-i /k -N -L 41234:127.0.0.1:6521 vsoc-01@10.0.0.9"));
        assert!(line.starts_with("-o LogLevel=ERROR"));
    }
}
