//! Fakes shared by the connection integration tests.
//!
//! Every fake records what it was asked to do so tests can assert on the
//! sequence of host commands, device calls and tunnel processes.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use devlink_connection::tunnel::{TunnelProcess, TunnelRequest, TunnelSpawner};
use devlink_connection::{
    ConnectionBuilder, ConnectionError, ConnectionFactory, ConnectionResult, DeviceHandle,
    DeviceKind, DeviceOptions, DeviceState, ErrorId, HostAndPort, HostOptions, LauncherFactory,
    LaunchRequest, LogDataType, ManagedDevice, RecoveryMode, TestLogger, VmInstanceInfo,
    VmLauncher, VmStatus,
};
use devlink_util::{CommandResult, CommandRunner, HostCommand};
use tokio::sync::watch;

/// Reply used when no rule matches.
pub fn unexpected() -> CommandResult {
    CommandResult::failed(1, "unexpected command")
}

pub fn adb_connected() -> CommandResult {
    CommandResult::success("already connected to the device")
}

struct Rule {
    pattern: String,
    replies: VecDeque<CommandResult>,
}

/// Answers host commands from substring rules over the joined command line. A
/// rule replays its replies in order and then keeps repeating the last one.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<HostCommand>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, pattern: &str, reply: CommandResult) -> &Self {
        self.on_seq(pattern, vec![reply])
    }

    pub fn on_seq(&self, pattern: &str, replies: Vec<CommandResult>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// `adb connect` always reports an established connection.
    pub fn adb_always_connects(&self) -> &Self {
        self.on(" connect ", adb_connected())
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(HostCommand::display).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.contains(pattern))
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: HostCommand) -> CommandResult {
        let line = command.display();
        self.commands.lock().unwrap().push(command);
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|rule| line.contains(&rule.pattern)) else {
            return unexpected();
        };
        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or_else(unexpected)
        } else {
            rule.replies.front().cloned().unwrap_or_else(unexpected)
        }
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::time::sleep(duration).await;
    }
}

/// A harness device whose answers are scripted.
pub struct FakeDevice {
    kind: DeviceKind,
    handle: Mutex<DeviceHandle>,
    state: Mutex<DeviceState>,
    recovery_mode: Mutex<RecoveryMode>,
    available: Mutex<VecDeque<bool>>,
    available_default: AtomicBool,
    modes_while_waiting: Mutex<Vec<RecoveryMode>>,
    pub shell_ok: AtomicBool,
    pub reset_ok: AtomicBool,
    pub online_ok: AtomicBool,
    kernel: Mutex<String>,
    pub logcat_started: AtomicUsize,
    pub logcat_stopped: AtomicUsize,
    pub resets: AtomicUsize,
    pub available_waits: AtomicUsize,
}

impl FakeDevice {
    pub fn new(kind: DeviceKind, handle: DeviceHandle) -> Arc<Self> {
        Arc::new(Self {
            kind,
            handle: Mutex::new(handle),
            state: Mutex::new(DeviceState::Online),
            recovery_mode: Mutex::new(RecoveryMode::Available),
            available: Mutex::new(VecDeque::new()),
            available_default: AtomicBool::new(true),
            modes_while_waiting: Mutex::new(Vec::new()),
            shell_ok: AtomicBool::new(true),
            reset_ok: AtomicBool::new(true),
            online_ok: AtomicBool::new(true),
            kernel: Mutex::new("5.15.110-android14-11-00001-g1234567".into()),
            logcat_started: AtomicUsize::new(0),
            logcat_stopped: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            available_waits: AtomicUsize::new(0),
        })
    }

    /// A remote virtual device slot that has not been launched yet.
    pub fn remote_placeholder(serial: &str) -> Arc<Self> {
        Self::new(
            DeviceKind::RemoteVirtual,
            DeviceHandle::Placeholder {
                serial: serial.into(),
                temporary: false,
            },
        )
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_available(&self, default: bool) {
        self.available_default.store(default, Ordering::SeqCst);
    }

    pub fn queue_available(&self, answers: &[bool]) {
        self.available.lock().unwrap().extend(answers.iter().copied());
    }

    pub fn set_kernel(&self, kernel: &str) {
        *self.kernel.lock().unwrap() = kernel.into();
    }

    pub fn modes_while_waiting(&self) -> Vec<RecoveryMode> {
        self.modes_while_waiting.lock().unwrap().clone()
    }
}

#[async_trait]
impl ManagedDevice for FakeDevice {
    fn serial(&self) -> String {
        self.handle.lock().unwrap().serial().to_string()
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn device_handle(&self) -> DeviceHandle {
        self.handle.lock().unwrap().clone()
    }

    fn set_device_handle(&self, handle: DeviceHandle) {
        *self.handle.lock().unwrap() = handle;
    }

    fn state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery_mode.lock().unwrap()
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        *self.recovery_mode.lock().unwrap() = mode;
    }

    async fn wait_for_device_available(&self, timeout: Duration) -> bool {
        self.available_waits.fetch_add(1, Ordering::SeqCst);
        self.modes_while_waiting
            .lock()
            .unwrap()
            .push(self.recovery_mode());
        let queued = self.available.lock().unwrap().pop_front();
        let available = queued.unwrap_or_else(|| self.available_default.load(Ordering::SeqCst));
        if !available {
            tokio::time::sleep(timeout).await;
        }
        available
    }

    async fn wait_for_device_not_available(&self, _timeout: Duration) -> bool {
        true
    }

    async fn wait_for_device_shell(&self, timeout: Duration) -> bool {
        let ok = self.shell_ok.load(Ordering::SeqCst);
        if !ok {
            tokio::time::sleep(timeout).await;
        }
        ok
    }

    async fn wait_for_device_online(&self, _timeout: Duration) -> ConnectionResult<()> {
        if self.online_ok.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(ConnectionError::not_available(
            "device never came online",
            self.serial(),
            ErrorId::DeviceUnavailable,
        ))
    }

    async fn execute_shell_command(&self, command: &str) -> ConnectionResult<String> {
        match command {
            "uname -r" => Ok(self.kernel.lock().unwrap().clone()),
            _ => Ok(String::new()),
        }
    }

    async fn enable_adb_root(&self) -> ConnectionResult<bool> {
        Ok(true)
    }

    async fn start_logcat(&self) {
        self.logcat_started.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop_logcat(&self) {
        self.logcat_stopped.fetch_add(1, Ordering::SeqCst);
    }

    async fn reset_device(&self) -> bool {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.reset_ok.load(Ordering::SeqCst)
    }
}

/// Launcher returning queued results; an empty queue is a launch error.
#[derive(Default)]
pub struct FakeLauncher {
    results: Mutex<VecDeque<ConnectionResult<VmInstanceInfo>>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<LaunchRequest>>,
    pub launches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub failure_log_downloads: AtomicUsize,
    pub serial_logs: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, result: ConnectionResult<VmInstanceInfo>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn factory(self: &Arc<Self>) -> LauncherFactory {
        let launcher = Arc::clone(self);
        Arc::new(move || Arc::clone(&launcher) as Arc<dyn VmLauncher>)
    }
}

pub fn hits(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        _logger: &dyn TestLogger,
    ) -> ConnectionResult<VmInstanceInfo> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(ConnectionError::setup(
                "no launch scripted",
                "fake",
                ErrorId::FailedToLaunchGce,
            ))
        })
    }

    async fn shutdown(&self, _instance: &VmInstanceInfo) -> bool {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn clean_up(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    async fn log_serial_output(&self, _instance: &VmInstanceInfo, _logger: &dyn TestLogger) {
        self.serial_logs.fetch_add(1, Ordering::SeqCst);
    }

    async fn download_launch_failure_logs(&self, _error: &ConnectionError, _logger: &dyn TestLogger) {
        self.failure_log_downloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tunnel process that lives until the test ends it or the monitor kills it.
pub struct FakeProcess {
    exited: Arc<watch::Sender<bool>>,
    watcher: watch::Receiver<bool>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelProcess for FakeProcess {
    fn is_alive(&mut self) -> bool {
        !*self.watcher.borrow()
    }

    async fn wait(&mut self) {
        let _ = self.watcher.wait_for(|exited| *exited).await;
    }

    async fn kill(&mut self, _timeout: Duration) -> bool {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exited.send_replace(true);
        true
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    processes: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    requests: Mutex<Vec<TunnelRequest>>,
    kills: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let spawner = Self::default();
        spawner.fail.store(true, Ordering::SeqCst);
        Arc::new(spawner)
    }

    pub fn spawned(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TunnelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Makes the most recent tunnel process exit on its own.
    pub fn exit_current(&self) {
        if let Some(process) = self.processes.lock().unwrap().last() {
            process.send_replace(true);
        }
    }
}

#[async_trait]
impl TunnelSpawner for FakeSpawner {
    async fn spawn(&self, request: &TunnelRequest) -> io::Result<Box<dyn TunnelProcess>> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ssh not installed"));
        }
        let (sender, watcher) = watch::channel(false);
        let exited = Arc::new(sender);
        self.processes.lock().unwrap().push(Arc::clone(&exited));
        Ok(Box::new(FakeProcess {
            exited,
            watcher,
            kills: Arc::clone(&self.kills),
        }))
    }
}

/// Logger keeping the names and sizes of what was logged.
#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<(String, LogDataType, PathBuf)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }
}

impl TestLogger for RecordingLogger {
    fn test_log(&self, name: &str, data_type: LogDataType, path: &Path) {
        self.entries
            .lock()
            .unwrap()
            .push((name.to_string(), data_type, path.to_path_buf()));
    }
}

pub fn instance(status: VmStatus) -> VmInstanceInfo {
    let mut info = VmInstanceInfo::new("ins-7f3a", HostAndPort::new("10.0.0.5", 6520), status);
    info.instance_user = Some("vsoc-01".into());
    info
}

/// Options for a remote virtual device reached through a tunnel.
pub fn ssh_options() -> DeviceOptions {
    DeviceOptions {
        evaluate_device_connection: false,
        instance_user: "vsoc-01".into(),
        gce_cmd_timeout_ms: 20 * 60 * 1000,
        ..Default::default()
    }
}

pub struct Harness {
    pub runner: Arc<FakeRunner>,
    pub spawner: Arc<FakeSpawner>,
    pub launcher: Arc<FakeLauncher>,
    pub factory: ConnectionFactory,
}

impl Harness {
    pub fn new(host: HostOptions) -> Self {
        Self::with_spawner(host, FakeSpawner::new())
    }

    pub fn with_spawner(host: HostOptions, spawner: Arc<FakeSpawner>) -> Self {
        let runner = FakeRunner::new();
        let launcher = FakeLauncher::new();
        let factory = ConnectionFactory::new(&host, launcher.factory())
            .with_runner(Arc::clone(&runner) as Arc<dyn CommandRunner>)
            .with_spawner(Arc::clone(&spawner) as Arc<dyn TunnelSpawner>);
        Self {
            runner,
            spawner,
            launcher,
            factory,
        }
    }

    pub fn builder(&self, device: &Arc<FakeDevice>, options: DeviceOptions) -> ConnectionBuilder {
        ConnectionBuilder::new(Arc::clone(device) as Arc<dyn ManagedDevice>, options)
    }
}
