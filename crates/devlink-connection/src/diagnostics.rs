//! Best-effort inspection of a virtual device host, used to put a more precise
//! error identifier on a launch failure.

use std::{sync::OnceLock, time::Duration};

use devlink_util::CommandRunner;
use regex::Regex;
use tracing::{info, warn};

use crate::config::DeviceOptions;
use crate::error::ErrorId;
use crate::instance::VmInstanceInfo;
use crate::remote::run_remote_command;

pub const DISK_USAGE_MAX: u32 = 95;

const INSPECT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Processes a healthy Cuttlefish host runs. Names carry a leading space so
/// they only match a bare command name in `ps -ef` output.
pub const EXPECTED_PROCESSES: &[(&str, ErrorId)] = &[
    (" netsimd", ErrorId::CuttlefishLaunchFailureBluetooth),
    (" openwrt_control_server", ErrorId::CuttlefishLaunchFailureOpenwrt),
    (" webRTC", ErrorId::CuttlefishLaunchFailureWebrtcCrash),
    (" crosvm", ErrorId::CuttlefishLaunchFailureCrosvm),
    (" nginx", ErrorId::CuttlefishLaunchFailureNginx),
];

const ERROR_SIGNATURES: &[(&str, ErrorId)] = &[
    ("bluetooth_failed", ErrorId::CuttlefishLaunchFailureBluetooth),
    (
        "fetch_cvd_failure_resolve_host",
        ErrorId::CuttlefishLaunchFailureCvdResolveHost,
    ),
    (
        "fetch_cvd_failure_connect_server",
        ErrorId::CuttlefishLaunchFailureCvdServerConnection,
    ),
    (
        "launch_cvd_port_collision",
        ErrorId::CuttlefishLaunchFailureCvdPortCollision,
    ),
    ("fetch_cvd_failure_general", ErrorId::CuttlefishLaunchFailureCvdFetch),
    ("cf_webrtc_crash", ErrorId::CuttlefishLaunchFailureWebrtcCrash),
    ("fetch_cvd_failure_artifact_not_found", ErrorId::ArtifactNotFound),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub id: ErrorId,
    pub detail: String,
}

/// Maps a comma separated launcher error signature list to the first known id.
pub fn convert_error_signature(signatures: &str) -> Option<ErrorId> {
    signatures.split(',').find_map(|signature| {
        ERROR_SIGNATURES
            .iter()
            .find(|(known, _)| *known == signature.trim())
            .map(|(_, id)| *id)
    })
}

/// Use percentage of the first filesystem in `df -P` output.
pub fn disk_usage_percent(df_output: &str) -> Option<u32> {
    static USE_PERCENT: OnceLock<Option<Regex>> = OnceLock::new();
    let re = USE_PERCENT
        .get_or_init(|| Regex::new(r"\s(\d+)%\s").ok())
        .as_ref()?;
    re.captures(df_output)?.get(1)?.as_str().parse().ok()
}

pub fn search_process(all_processes: &str, process: &str) -> bool {
    all_processes.lines().any(|line| line.contains(process))
}

pub fn missing_expected_process(all_processes: &str) -> Option<(&'static str, ErrorId)> {
    EXPECTED_PROCESSES
        .iter()
        .find(|(name, _)| !search_process(all_processes, name))
        .copied()
}

fn adb_lists_device(adb_output: &str) -> bool {
    adb_output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .any(|line| line.split_whitespace().nth(1) == Some("device"))
}

/// Inspects the instance host over ssh. Commands that fail to run contribute
/// nothing; this never returns an error.
pub async fn inspect_host(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
) -> Option<Classification> {
    if instance.host().is_none() {
        return None;
    }
    let user = instance.user_or(&options.instance_user).to_string();

    let df = run_remote_command(
        instance,
        options,
        runner,
        INSPECT_CMD_TIMEOUT,
        &["df", "-P", &format!("/home/{user}")],
    )
    .await;
    if df.is_success() {
        if let Some(usage) = disk_usage_percent(&df.stdout) {
            if usage > DISK_USAGE_MAX {
                return Some(classify(
                    ErrorId::NoDiskSpace,
                    format!("host disk usage is {usage}%, above {DISK_USAGE_MAX}%"),
                ));
            }
        }
    }

    let ps = run_remote_command(instance, options, runner, INSPECT_CMD_TIMEOUT, &["ps", "-ef"]).await;
    if ps.is_success() {
        if let Some((name, id)) = missing_expected_process(&ps.stdout) {
            return Some(classify(
                id,
                format!("expected process '{}' is not running", name.trim()),
            ));
        }
    }

    let adb = run_remote_command(
        instance,
        options,
        runner,
        INSPECT_CMD_TIMEOUT,
        &["./bin/adb", "devices"],
    )
    .await;
    if adb.is_success() && !adb_lists_device(&adb.stdout) {
        return Some(classify(
            ErrorId::DeviceUnavailable,
            "no device listed by adb on the host".to_string(),
        ));
    }

    info!("host inspection of {} found nothing", instance.instance_name);
    None
}

fn classify(id: ErrorId, detail: String) -> Classification {
    warn!("host inspection: {detail} ({id})");
    Classification { id, detail }
}
