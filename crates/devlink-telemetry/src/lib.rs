//! Invocation metrics plus an opt-in log of connection lifecycle events.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub mod metrics;

pub use metrics::{InvocationMetrics, MetricKey, MetricValue};

const QUEUE_DEPTH: usize = 256;
const ROTATE_AT_BYTES: u64 = 2 * 1024 * 1024;
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub enabled: bool,
    /// Defaults to `$DEVLINK_DATA_DIR/telemetry/<app>`.
    pub dir: Option<PathBuf>,
}

impl SinkOptions {
    /// `DEVLINK_TELEMETRY` turns the log on, `DEVLINK_TELEMETRY_DIR` moves it.
    pub fn from_env(app_name: &'static str, app_version: &'static str) -> Self {
        Self {
            app_name,
            app_version,
            enabled: std::env::var("DEVLINK_TELEMETRY")
                .map(|value| {
                    matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(false),
            dir: std::env::var_os("DEVLINK_TELEMETRY_DIR").map(PathBuf::from),
        }
    }
}

#[derive(Debug, Serialize)]
struct EventRecord {
    kind: String,
    serial: String,
    outcome: String,
    at_unix_millis: u128,
    app: &'static str,
    version: &'static str,
    session: String,
}

/// Process-wide event log. Records are handed to a writer thread through a
/// bounded queue; when the queue is full the record is dropped.
pub struct EventLog {
    app_name: &'static str,
    app_version: &'static str,
    session: String,
    path: PathBuf,
    enabled: AtomicBool,
    queue: SyncSender<EventRecord>,
}

impl EventLog {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record(&self, kind: &str, serial: &str, outcome: &str) {
        if !self.is_enabled() {
            return;
        }
        let record = EventRecord {
            kind: kind.to_string(),
            serial: serial.to_string(),
            outcome: outcome.to_string(),
            at_unix_millis: unix_millis(),
            app: self.app_name,
            version: self.app_version,
            session: self.session.clone(),
        };
        let _ = self.queue.try_send(record);
    }
}

static EVENT_LOG: OnceLock<Arc<EventLog>> = OnceLock::new();

/// Installs the global log. Later calls only update the enabled flag.
pub fn init(options: SinkOptions) -> Arc<EventLog> {
    if let Some(log) = EVENT_LOG.get() {
        log.enabled.store(options.enabled, Ordering::Relaxed);
        return Arc::clone(log);
    }
    let dir = options
        .dir
        .unwrap_or_else(|| default_dir().join(options.app_name));
    let (queue, pending) = sync_channel(QUEUE_DEPTH);
    let log = Arc::new(EventLog {
        app_name: options.app_name,
        app_version: options.app_version,
        session: format!("{:x}-{:x}", unix_millis(), std::process::id()),
        path: dir.join(EVENTS_FILE),
        enabled: AtomicBool::new(options.enabled),
        queue,
    });
    spawn_writer(JsonlWriter::new(log.path.clone(), ROTATE_AT_BYTES), pending);
    let log = EVENT_LOG.get_or_init(|| log);
    Arc::clone(log)
}

pub fn init_with_env(app_name: &'static str, app_version: &'static str) -> Arc<EventLog> {
    init(SinkOptions::from_env(app_name, app_version))
}

pub fn global() -> Option<Arc<EventLog>> {
    EVENT_LOG.get().cloned()
}

pub fn set_enabled(enabled: bool) {
    if let Some(log) = EVENT_LOG.get() {
        log.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Records a lifecycle event for `serial`. Does nothing until `init` has run.
pub fn event(kind: &str, serial: &str, outcome: &str) {
    if let Some(log) = EVENT_LOG.get() {
        log.record(kind, serial, outcome);
    }
}

fn spawn_writer(mut writer: JsonlWriter, pending: Receiver<EventRecord>) {
    let spawned = thread::Builder::new()
        .name("devlink-events".into())
        .spawn(move || {
            for record in pending {
                if let Err(err) = writer.append(&record) {
                    eprintln!("devlink-telemetry: {}: {err}", writer.path.display());
                }
            }
        });
    if let Err(err) = spawned {
        eprintln!("devlink-telemetry: event writer not started: {err}");
    }
}

/// Appends one JSON document per line, moving the file to `<name>.1` once it
/// reaches `limit` bytes.
struct JsonlWriter {
    path: PathBuf,
    limit: u64,
    written: Option<u64>,
}

impl JsonlWriter {
    fn new(path: PathBuf, limit: u64) -> Self {
        Self {
            path,
            limit,
            written: None,
        }
    }

    fn append<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let mut line = serde_json::to_vec(value).map_err(io::Error::other)?;
        line.push(b'\n');

        let written = match self.written {
            Some(written) => written,
            None => fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0),
        };
        let written = if written >= self.limit {
            fs::rename(&self.path, self.path.with_extension("jsonl.1"))?;
            0
        } else {
            written
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        self.written = Some(written + line.len() as u64);
        Ok(())
    }
}

fn default_dir() -> PathBuf {
    let data = match std::env::var_os("DEVLINK_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/devlink"),
            None => PathBuf::from("/tmp/devlink"),
        },
    };
    data.join("telemetry")
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
