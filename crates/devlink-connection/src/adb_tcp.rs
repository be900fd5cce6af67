use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use devlink_util::{env_opt, CommandResult, CommandRunner, HostCommand};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectionError, ConnectionResult, ErrorId};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_RETRIES: u32 = 5;
pub const DEFAULT_SHORT_CMD_TIMEOUT: Duration = Duration::from_secs(20);

const ADB_SUCCESS_CONNECT_TAG: &str = "connected to";
const ADB_ALREADY_CONNECTED_TAG: &str = "already";
const ADB_CONN_REFUSED: &str = "connection refused";
const ATTEMPT_SEPARATOR: &str = "\n======= SEPARATOR OF ATTEMPTS =====\n";

const IPADDRESS_PATTERN: &str = r"^((([01]?\d\d?|2[0-4]\d|25[0-5])\.([01]?\d\d?|2[0-4]\d|25[0-5])\.([01]?\d\d?|2[0-4]\d|25[0-5])\.([01]?\d\d?|2[0-4]\d|25[0-5]))|localhost)";

pub(crate) fn adb_path() -> PathBuf {
    if let Some(path) = env_opt("DEVLINK_ADB_PATH").or_else(|| env_opt("ADB_PATH")) {
        return PathBuf::from(path);
    }
    if let Some(sdk_root) = env_opt("ANDROID_SDK_ROOT").or_else(|| env_opt("ANDROID_HOME")) {
        let candidate = PathBuf::from(&sdk_root).join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

static IP_ADDRESS: OnceLock<Option<Regex>> = OnceLock::new();
static TCP_SERIAL: OnceLock<Option<Regex>> = OnceLock::new();

fn ip_regex() -> Option<&'static Regex> {
    IP_ADDRESS
        .get_or_init(|| Regex::new(IPADDRESS_PATTERN).ok())
        .as_ref()
}

/// True for `ip:port` or `localhost:port` serials.
pub fn is_tcp_device_serial(serial: &str) -> bool {
    TCP_SERIAL
        .get_or_init(|| Regex::new(&format!(r"{IPADDRESS_PATTERN}:([0-9]{{2,5}})\b")).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(serial.trim()))
}

fn split_serial(serial: &str) -> ConnectionResult<(&str, &str)> {
    let invalid = || ConnectionError::InvalidSerial {
        serial: serial.to_string(),
    };
    let mut parts = serial.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let host_ok = ip_regex()
        .and_then(|re| re.find(host))
        .is_some_and(|m| m.end() == host.len());
    if !host_ok || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok((host, port))
}

/// Host part of a `host:port` serial.
pub fn host_name(serial: &str) -> ConnectionResult<String> {
    split_serial(serial).map(|(host, _)| host.to_string())
}

pub fn port_num(serial: &str) -> ConnectionResult<String> {
    split_serial(serial).map(|(_, port)| port.to_string())
}

/// adb-over-TCP operations shared by the TCP connection and the tunnel monitor.
pub struct AdbTcp {
    runner: Arc<dyn CommandRunner>,
    adb: String,
    connect_log: Mutex<Option<PathBuf>>,
}

impl AdbTcp {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            adb: adb_path().display().to_string(),
            connect_log: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn adb(&self) -> &str {
        &self.adb
    }

    /// While set, `adb connect` runs with `ADB_TRACE=1` and its stderr is
    /// appended to this file.
    pub fn set_connect_log(&self, path: Option<PathBuf>) {
        if let Ok(mut guard) = self.connect_log.lock() {
            *guard = path;
        }
    }

    pub fn connect_log(&self) -> Option<PathBuf> {
        self.connect_log.lock().ok().and_then(|guard| guard.clone())
    }

    async fn adb_connect(&self, host: &str, port: &str) -> CommandResult {
        let log = self.connect_log();
        let mut cmd = HostCommand::new(
            DEFAULT_SHORT_CMD_TIMEOUT,
            [self.adb.clone(), "connect".into(), format!("{host}:{port}")],
        );
        if log.is_some() {
            cmd = cmd.env("ADB_TRACE", "1");
        }
        let result = self.runner.run(cmd).await;
        if let Some(path) = log {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| {
                    file.write_all(result.stderr.as_bytes())?;
                    file.write_all(ATTEMPT_SEPARATOR.as_bytes())
                });
            if let Err(err) = written {
                warn!("failed to append to {}: {err}", path.display());
            }
        }
        result
    }

    async fn confirm(&self, host: &str, port: &str) -> bool {
        let result = self.adb_connect(host, port).await;
        if result.is_success() && result.stdout.contains(ADB_ALREADY_CONNECTED_TAG) {
            debug!("adb connect confirmed: {}", result.stdout.trim());
            return true;
        }
        debug!(
            "adb connect confirmation failed: status {:?}\n{}",
            result.status,
            result.log_text()
        );
        false
    }

    /// Connects with bounded retries. A "connected to" reply is only trusted once
    /// a second connect reports "already connected", since a forwarded port can
    /// accept the connection before the device behind it does.
    pub async fn connect(&self, host: &str, port: &str) -> bool {
        let log_hint = self
            .connect_log()
            .map(|path| format!(" Found more details in adb connection log: {}", path.display()))
            .unwrap_or_default();
        for attempt in 0..MAX_RETRIES {
            let result = self.adb_connect(host, port).await;
            debug!(
                "adb connect output: status: {:?} stdout: {}",
                result.status,
                result.stdout.trim()
            );
            if result.is_success() && result.stdout.contains(ADB_SUCCESS_CONNECT_TAG) {
                if self.confirm(host, port).await {
                    return true;
                }
            } else if result.is_success()
                && result.stdout.to_ascii_lowercase().contains(ADB_CONN_REFUSED)
            {
                error!("adb connection to {host}:{port} was refused.{log_hint}");
                return false;
            }
            debug!("adb connect retrying");
            self.runner.sleep(RETRY_INTERVAL * (attempt + 1)).await;
        }
        error!("all attempts to connect to {host}:{port} with adb failed.{log_hint}");
        false
    }

    pub async fn disconnect(&self, host: &str, port: &str) -> bool {
        self.runner
            .run_timed_cmd(
                DEFAULT_SHORT_CMD_TIMEOUT,
                &[&self.adb, "disconnect", &format!("{host}:{port}")],
            )
            .await
            .is_success()
    }

    /// Polls the connection confirmation until it holds or `wait` elapses.
    pub async fn wait_for_connect(&self, serial: &str, wait: Duration) -> ConnectionResult<()> {
        let host = host_name(serial)?;
        let port = port_num(serial)?;
        info!("waiting {}ms for adb connection to {serial}", wait.as_millis());
        let start = Instant::now();
        while start.elapsed() < wait {
            if self.confirm(&host, &port).await {
                debug!("adb connection confirmed");
                return Ok(());
            }
            self.runner.sleep(RETRY_INTERVAL).await;
        }
        Err(ConnectionError::not_available(
            format!("No adb connection after {}ms.", wait.as_millis()),
            serial,
            ErrorId::FailedToConnectToTcpDevice,
        ))
    }
}
