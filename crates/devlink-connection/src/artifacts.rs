use std::{fs, sync::OnceLock, time::Duration};

use devlink_util::CommandRunner;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::config::{DeviceOptions, InstanceType};
use crate::instance::VmInstanceInfo;
use crate::logger::{LogDataType, TestLogger};
use crate::remote::{fetch_remote_dir, fetch_remote_file, remote_output, run_remote_command};

const REMOTE_FILE_OP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const BUGREPORT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const FETCH_TOMBSTONES_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A log file expected on the host of a given instance type. `%s` is the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownLogFile {
    pub path: &'static str,
    pub log_name: Option<&'static str>,
    pub data_type: LogDataType,
}

const fn known(
    path: &'static str,
    log_name: Option<&'static str>,
    data_type: LogDataType,
) -> KnownLogFile {
    KnownLogFile {
        path,
        log_name,
        data_type,
    }
}

const CUTTLEFISH_FILES: &[KnownLogFile] = &[
    known("/home/%s/fetcher_config.json", None, LogDataType::Text),
    known("/home/%s/cuttlefish_runtime/kernel.log", None, LogDataType::KernelLog),
    known(
        "/home/%s/cuttlefish_runtime/logcat",
        Some("full_gce_logcat"),
        LogDataType::Logcat,
    ),
    known("/home/%s/cuttlefish_runtime/cuttlefish_config.json", None, LogDataType::Text),
    known(
        "/home/%s/cuttlefish_runtime/launcher.log",
        Some("cuttlefish_launcher.log"),
        LogDataType::CuttlefishLog,
    ),
    known("/var/log/kern.log", Some("host_kernel.log"), LogDataType::KernelLog),
];

const EMULATOR_FILES: &[KnownLogFile] = &[
    known(
        "/home/%s/log/logcat.log",
        Some("full_gce_emulator_logcat"),
        LogDataType::Logcat,
    ),
    known("/home/%s/log/adb.log", None, LogDataType::Text),
    known("/home/%s/log/kernel.log", None, LogDataType::KernelLog),
    known("/var/log/daemon.log", None, LogDataType::Text),
    known("/var/log/kern.log", Some("host_kernel.log"), LogDataType::KernelLog),
];

pub fn known_files(instance_type: InstanceType) -> &'static [KnownLogFile] {
    match instance_type {
        InstanceType::Cuttlefish | InstanceType::RemoteNestedAvd => CUTTLEFISH_FILES,
        InstanceType::Emulator => EMULATOR_FILES,
        _ => &[],
    }
}

fn log_name_for(entry: &KnownLogFile, remote_path: &str) -> String {
    if let Some(name) = entry.log_name {
        return name.to_string();
    }
    remote_path
        .rsplit('/')
        .next()
        .unwrap_or(remote_path)
        .to_string()
}

/// Fetches every known log file for the instance type and hands it to the logger.
pub async fn fetch_common_files(
    logger: &dyn TestLogger,
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
) {
    let files = known_files(options.instance_type);
    if files.is_empty() {
        return;
    }
    let user = instance.user_or(&options.instance_user).to_string();
    let tmp = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!("cannot create temp dir for remote logs: {err}");
            return;
        }
    };
    for entry in files {
        let remote_path = entry.path.replace("%s", &user);
        let name = log_name_for(entry, &remote_path);
        let local = tmp.path().join(&name);
        if fetch_remote_file(
            instance,
            options,
            runner,
            REMOTE_FILE_OP_TIMEOUT,
            &remote_path,
            &local,
        )
        .await
        {
            logger.test_log(&name, entry.data_type, &local);
        } else {
            debug!("remote file {remote_path} not collected");
        }
    }
}

pub async fn fetch_tombstones(
    logger: &dyn TestLogger,
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
) {
    if !matches!(
        options.instance_type,
        InstanceType::Cuttlefish | InstanceType::RemoteAvd | InstanceType::RemoteNestedAvd
    ) {
        return;
    }
    let pattern = format!(
        "/home/{}/cuttlefish_runtime/tombstones/*",
        instance.user_or(&options.instance_user)
    );
    let listing = run_remote_command(
        instance,
        options,
        runner,
        REMOTE_COMMAND_TIMEOUT,
        &["ls", "-A1", &pattern],
    )
    .await;
    if !listing.is_success() {
        error!("failed to list the tombstones: {}", listing.stderr.trim());
        return;
    }
    if listing.stdout.trim().is_empty() {
        return;
    }
    let tmp = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!("cannot create temp dir for tombstones: {err}");
            return;
        }
    };
    let local = tmp.path().join("tombstones");
    if let Err(err) = fs::create_dir_all(&local) {
        warn!("cannot create {}: {err}", local.display());
        return;
    }
    if fetch_remote_dir(
        instance,
        options,
        runner,
        FETCH_TOMBSTONES_TIMEOUT,
        &pattern,
        &local,
    )
    .await
    {
        logger.test_log("tombstones", LogDataType::Dir, &local);
    }
}

/// Parses the device path out of a `bugreportz` reply (`OK:/path/to/file.zip`).
pub fn parse_bugreportz_path(output: &str) -> Option<String> {
    static BUGREPORTZ_OK: OnceLock<Option<Regex>> = OnceLock::new();
    let re = BUGREPORTZ_OK
        .get_or_init(|| Regex::new(r"OK:(.*)").ok())
        .as_ref()?;
    let path = re.captures(output)?.get(1)?.as_str().trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Collects a bugreport over ssh so a broken adb transport doesn't prevent it.
pub async fn ssh_bugreport(
    logger: &dyn TestLogger,
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
) {
    let nested = !matches!(
        options.instance_type,
        InstanceType::Gce | InstanceType::RemoteAvd
    );
    let output = if nested {
        remote_output(
            instance,
            options,
            runner,
            BUGREPORT_TIMEOUT,
            &["./bin/adb", "wait-for-device", "shell", "bugreportz"],
        )
        .await
    } else {
        remote_output(instance, options, runner, BUGREPORT_TIMEOUT, &["bugreportz"]).await
    };
    let Some(device_path) = parse_bugreportz_path(&output) else {
        error!("something went wrong during bugreportz collection: '{output}'");
        return;
    };
    let remote_path = if nested {
        let pulled = remote_output(
            instance,
            options,
            runner,
            BUGREPORT_TIMEOUT,
            &["./bin/adb", "pull", &device_path],
        )
        .await;
        debug!("{pulled}");
        let file_name = device_path.rsplit('/').next().unwrap_or(&device_path);
        format!("./{file_name}")
    } else {
        device_path
    };
    let tmp = match tempfile::Builder::new()
        .prefix("bugreport-ssh")
        .suffix(".zip")
        .tempfile()
    {
        Ok(file) => file,
        Err(err) => {
            warn!("cannot create temp file for bugreport: {err}");
            return;
        }
    };
    if fetch_remote_file(
        instance,
        options,
        runner,
        REMOTE_FILE_OP_TIMEOUT,
        &remote_path,
        tmp.path(),
    )
    .await
    {
        logger.test_log("bugreportz-ssh", LogDataType::Bugreportz, tmp.path());
    }
}

/// Runs a command on the host and logs its exit status and output as a text file.
pub async fn log_remote_command_output(
    logger: &dyn TestLogger,
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    log_name: &str,
    command: &[&str],
) {
    let res = run_remote_command(instance, options, runner, REMOTE_COMMAND_TIMEOUT, command).await;
    let body = format!(
        "Command: {}\nExit code: {}, Status: {:?}\nstdout:\n{}\nstderr:\n{}\n",
        command.join(" "),
        res.exit_code.unwrap_or(-1),
        res.status,
        res.stdout,
        res.stderr
    );
    match tempfile::NamedTempFile::new().and_then(|file| {
        fs::write(file.path(), body)?;
        Ok(file)
    }) {
        Ok(file) => logger.test_log(log_name, LogDataType::Text, file.path()),
        Err(err) => warn!("cannot stage {log_name}: {err}"),
    }
}
