//! Commands executed on the host that runs a virtual device, over plain ssh/scp.

use std::{path::Path, time::Duration};

use devlink_util::{CommandResult, CommandRunner};
use tracing::{debug, warn};

use crate::config::DeviceOptions;
use crate::instance::VmInstanceInfo;

pub(crate) const SSH_OPTIONS: &[&str] = &[
    "-o",
    "LogLevel=ERROR",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "ServerAliveInterval=10",
];

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(30);

fn ssh_target(instance: &VmInstanceInfo, options: &DeviceOptions) -> Option<String> {
    let host = instance.host()?;
    Some(format!(
        "{}@{}",
        instance.user_or(&options.instance_user),
        host
    ))
}

fn push_identity(args: &mut Vec<String>, options: &DeviceOptions) {
    if let Some(key) = options.ssh_key() {
        args.push("-i".into());
        args.push(key);
    }
}

/// Full `ssh` command line running `command` on the instance host.
pub fn ssh_command_line(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    command: &[&str],
) -> Option<Vec<String>> {
    let target = ssh_target(instance, options)?;
    let mut args = vec!["ssh".to_string()];
    args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    push_identity(&mut args, options);
    args.push(target);
    args.extend(command.iter().map(|s| s.to_string()));
    Some(args)
}

pub fn scp_command_line(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    extra: &[&str],
    remote_path: &str,
    local: &Path,
) -> Option<Vec<String>> {
    let target = ssh_target(instance, options)?;
    let mut args = vec!["scp".to_string()];
    args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    push_identity(&mut args, options);
    args.extend(extra.iter().map(|s| s.to_string()));
    args.push(format!("{target}:{remote_path}"));
    args.push(local.display().to_string());
    Some(args)
}

pub async fn run_remote_command(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    timeout: Duration,
    command: &[&str],
) -> CommandResult {
    let Some(argv) = ssh_command_line(instance, options, command) else {
        warn!(
            "instance {} has no host, cannot run {:?}",
            instance.instance_name, command
        );
        return CommandResult::exception("instance host unknown");
    };
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    runner.run_timed_cmd(timeout, &argv).await
}

/// Runs a remote command and returns its trimmed stdout, logging when it fails or
/// prints nothing.
pub async fn remote_output(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    timeout: Duration,
    command: &[&str],
) -> String {
    let res = run_remote_command(instance, options, runner, timeout, command).await;
    let output = res.stdout.trim().to_string();
    if !res.is_success() {
        warn!("issue when attempting to execute {command:?}: {}", res.stderr.trim());
    } else if output.is_empty() {
        debug!("stdout from {command:?} was empty: {}", res.stderr.trim());
    }
    output
}

pub async fn fetch_remote_file(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    timeout: Duration,
    remote_path: &str,
    local: &Path,
) -> bool {
    scp(instance, options, runner, timeout, &[], remote_path, local).await
}

pub async fn fetch_remote_dir(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    timeout: Duration,
    remote_path: &str,
    local: &Path,
) -> bool {
    scp(instance, options, runner, timeout, &["-r"], remote_path, local).await
}

async fn scp(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
    timeout: Duration,
    extra: &[&str],
    remote_path: &str,
    local: &Path,
) -> bool {
    let Some(argv) = scp_command_line(instance, options, extra, remote_path, local) else {
        return false;
    };
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    let res = runner.run_timed_cmd(timeout, &argv).await;
    if !res.is_success() {
        debug!(
            "failed to fetch {remote_path} from {}: {}",
            instance.instance_name,
            res.stderr.trim()
        );
        return false;
    }
    true
}

/// Cheap ssh round trip used to gate artifact collection.
pub async fn is_reachable_by_ssh(
    instance: &VmInstanceInfo,
    options: &DeviceOptions,
    runner: &dyn CommandRunner,
) -> bool {
    run_remote_command(instance, options, runner, REACHABILITY_TIMEOUT, &["true"])
        .await
        .is_success()
}
