//! Implementation of the container sandbox backend.
//!
//! Drives the `docker` CLI directly: the user command is fed to the
//! container's shell over stdin so no host directory is ever bind-mounted,
//! and each job may get its own throwaway bridge network. Containers run
//! with all capabilities dropped (minus a configured allow-list),
//! `no-new-privileges`, no host IPC namespace, and CPU/memory/pid/fd
//! limits derived from the job's resource limits.

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use super::EXIT_CONTAINER_UNUSABLE;
use super::Execution;
use super::LogSink;
use super::local;
use super::supervise;
use crate::config::ContainerConfig;
use crate::db::LogStream;

/// Time allowed for the `docker info` preflight.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for per-job network creation and removal.
const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Guest working directory inside the container.
const GUEST_WORK_DIR: &str = "/work";

/// Run a command in the container sandbox.
///
/// When the runtime binary is absent the local backend takes over with a
/// `system` note; when the runtime is present but unusable the job fails
/// with [`EXIT_CONTAINER_UNUSABLE`].
pub async fn run(
    execution: &Execution,
    config: &ContainerConfig,
    on_log: &LogSink,
) -> Result<i32> {
    if which::which("docker").is_err() {
        on_log(
            LogStream::System,
            String::from("docker not found; falling back to local sandbox\n"),
        );
        return local::run(execution, on_log).await;
    }

    if !preflight(on_log).await {
        return Ok(EXIT_CONTAINER_UNUSABLE);
    }

    let network = JobNetwork::acquire(&config.network_mode, on_log).await;
    let result = run_container(execution, config, network.name(), on_log).await;
    network.release(on_log).await;

    result
}

/// Check that the docker daemon answers before attempting a job.
async fn preflight(on_log: &LogSink) -> bool {
    let mut command = Command::new("docker");
    command
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(PREFLIGHT_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            on_log(LogStream::System, format!("docker preflight failed: {e}\n"));
            return false;
        }
        Err(_) => {
            on_log(
                LogStream::System,
                String::from("docker preflight timed out\n"),
            );
            return false;
        }
    };

    if output.status.success() {
        return true;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    on_log(
        LogStream::System,
        String::from("docker is not usable on this worker\n"),
    );
    if !stderr.is_empty() {
        on_log(LogStream::System, format!("{stderr}\n"));
    }
    if stderr.to_lowercase().contains("permission denied") && stderr.contains("docker.sock") {
        on_log(
            LogStream::System,
            String::from(
                "hint: add your user to the docker group and re-login (or run `newgrp docker`)\n",
            ),
        );
    }

    false
}

/// The network a job container attaches to.
///
/// A `job` mode network is a scoped acquisition: it is created before launch
/// and must be removed on every exit path; removal failures are logged and
/// never fail the job.
enum JobNetwork {
    /// A per-job bridge network owned by this job.
    Owned(String),
    /// A pre-existing network (`bridge`, `none`, or a named one).
    Shared(String),
}

impl JobNetwork {
    /// Resolve the configured network mode, creating a per-job bridge when
    /// the mode is `job`.
    async fn acquire(mode: &str, on_log: &LogSink) -> Self {
        let mode = mode.trim();
        if mode != "job" {
            let name = if mode.is_empty() { "bridge" } else { mode };
            return JobNetwork::Shared(name.to_string());
        }

        let name = format!("crucible-job-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let mut command = Command::new("docker");
        command
            .args(["network", "create", "--driver", "bridge", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(NETWORK_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => JobNetwork::Owned(name),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                on_log(
                    LogStream::System,
                    format!(
                        "failed to create job network; falling back to bridge: {}\n",
                        stderr.trim()
                    ),
                );
                JobNetwork::Shared(String::from("bridge"))
            }
            Ok(Err(e)) => {
                on_log(
                    LogStream::System,
                    format!("failed to create job network; falling back to bridge: {e}\n"),
                );
                JobNetwork::Shared(String::from("bridge"))
            }
            Err(_) => {
                on_log(
                    LogStream::System,
                    String::from(
                        "timed out creating job network; falling back to bridge\n",
                    ),
                );
                JobNetwork::Shared(String::from("bridge"))
            }
        }
    }

    /// The network name to pass to `docker run`.
    fn name(&self) -> &str {
        match self {
            JobNetwork::Owned(name) | JobNetwork::Shared(name) => name,
        }
    }

    /// Remove an owned per-job network; shared networks are left alone.
    async fn release(self, on_log: &LogSink) {
        let JobNetwork::Owned(name) = self else {
            return;
        };

        let mut command = Command::new("docker");
        command
            .args(["network", "rm", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(NETWORK_TIMEOUT, command.status()).await {
            Ok(Ok(status)) if status.success() => {}
            _ => on_log(
                LogStream::System,
                format!("warning: failed to remove job network {name}\n"),
            ),
        }
    }
}

/// Launch the job container and supervise it to completion.
async fn run_container(
    execution: &Execution,
    config: &ContainerConfig,
    network: &str,
    on_log: &LogSink,
) -> Result<i32> {
    let image = execution
        .image
        .as_deref()
        .unwrap_or(&config.default_image)
        .to_string();
    let limits = &execution.limits;

    // Scale a CPU share out of the CPU-seconds budget, clamped to a sane
    // range the same way the limits themselves are host-wide defaults.
    let cpus = (limits.cpu_seconds as f64 / 300.0).clamp(0.1, 4.0);

    let mut command = Command::new("docker");
    command
        .arg("run")
        .arg("-i")
        .arg("--rm")
        .args(["--network", network])
        .args(["--ipc", "none"])
        .args(["--security-opt", "no-new-privileges"])
        .args(["--cap-drop", "ALL"])
        .args(["--pids-limit", limits.pids.to_string().as_str()])
        .args(["--memory", limits.memory_bytes.to_string().as_str()])
        .args(["--cpus", format!("{cpus}").as_str()])
        .args(["--ulimit", format!("nofile={n}:{n}", n = limits.nofile).as_str()])
        .args(["--tmpfs", "/tmp:rw,nosuid,nodev,size=256m"])
        .args(["--workdir", GUEST_WORK_DIR]);

    for cap in parse_caps(&config.cap_add) {
        command.args(["--cap-add", cap.as_str()]);
    }

    // With a read-only rootfs the working directory becomes a tmpfs;
    // otherwise the bootstrap script creates it on the writable rootfs.
    if config.read_only_rootfs {
        command
            .arg("--read-only")
            .args(["--tmpfs", "/work:rw,nosuid,nodev,size=1024m"]);
    }

    if let Some(user) = resolve_user(&config.run_as) {
        command.args(["--user", user.as_str()]);
    }

    command
        .arg(&image)
        .args(["/bin/sh", "-s"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().context("failed to spawn `docker run`")?;

    // The command travels over stdin so no host path is bind-mounted.
    let script = format!("set -eu\nmkdir -p /work\n{}\n", execution.command);
    let mut stdin = child.stdin.take().context("docker stdin not captured")?;
    stdin
        .write_all(script.as_bytes())
        .await
        .context("failed to write job script to docker stdin")?;
    drop(stdin);

    supervise(child, execution.timeout, on_log).await
}

/// Normalize a comma-separated capability list: uppercased, `CAP_` prefix
/// stripped, deduplicated, deterministic order.
fn parse_caps(raw: &str) -> Vec<String> {
    let mut caps: Vec<String> = raw
        .split(',')
        .map(|part| {
            let cap = part.trim().to_uppercase();
            cap.strip_prefix("CAP_").map(str::to_string).unwrap_or(cap)
        })
        .filter(|cap| !cap.is_empty())
        .collect();
    caps.sort();
    caps.dedup();
    caps
}

/// Resolve the configured container user to a `uid:gid` spec.
fn resolve_user(run_as: &str) -> Option<String> {
    let run_as = run_as.trim();
    match run_as.to_lowercase().as_str() {
        "" => None,
        "root" => Some(String::from("0:0")),
        "nobody" => Some(String::from("65534:65534")),
        _ => Some(run_as.to_string()),
    }
}
