//! Implementation of the local sandbox backend.
//!
//! Runs the command as a native subprocess in a fresh temporary working
//! directory with a minimal environment and POSIX resource limits applied
//! before exec. This offers no container-grade isolation; it exists for
//! trusted hosts and as the fallback when no container runtime is present.

use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use tokio::process::Command;

use super::Execution;
use super::LogSink;
use super::supervise;

/// Run a command in the local sandbox.
pub async fn run(execution: &Execution, on_log: &LogSink) -> Result<i32> {
    // A fresh scratch directory doubles as the working directory and HOME;
    // it is removed when the guard drops.
    let scratch = tempfile::Builder::new()
        .prefix("crucible-job-")
        .tempdir()
        .context("failed to create job working directory")?;

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&execution.command)
        .current_dir(scratch.path())
        .env_clear()
        .env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| String::from("/usr/bin:/bin")),
        )
        .env("HOME", scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        let limits = execution.limits.clone();
        // Applied in the forked child just before exec.
        unsafe {
            command.pre_exec(move || {
                set_rlimit(libc::RLIMIT_CPU as libc::c_int, limits.cpu_seconds)?;
                set_rlimit(libc::RLIMIT_AS as libc::c_int, limits.memory_bytes)?;
                set_rlimit(libc::RLIMIT_NPROC as libc::c_int, limits.pids)?;
                set_rlimit(libc::RLIMIT_NOFILE as libc::c_int, limits.nofile)?;
                Ok(())
            });
        }
    }

    let child = command.spawn().context("failed to spawn `/bin/sh`")?;
    let code = supervise(child, execution.timeout, on_log).await?;

    scratch
        .close()
        .context("failed to remove job working directory")?;

    Ok(code)
}

/// Apply one resource limit with hard == soft.
#[cfg(unix)]
fn set_rlimit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };

    // Safety: `rlim` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource as _, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
