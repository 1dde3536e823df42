//! Sandboxed execution of job commands.
//!
//! The executor runs a shell command under resource limits and a wall-clock
//! timeout, emitting an ordered stream of log records through a caller
//! -supplied sink and returning the final exit code. It never touches the
//! store; the sink is the only output channel besides the exit code, which
//! keeps both backends testable with an in-memory accumulator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::config::ContainerConfig;
use crate::db::LogStream;
use crate::db::Sandbox;

pub mod container;
pub mod local;

/// Exit code reported when the wall-clock timeout killed the job.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported when the container runtime is present but unusable.
pub const EXIT_CONTAINER_UNUSABLE: i32 = 126;

/// Grace period for the log pumps to drain tail output after the child
/// exits.
const PUMP_GRACE: Duration = Duration::from_secs(1);

/// The sink log records are delivered through.
///
/// The executor calls it from two concurrent pump tasks, so implementations
/// must tolerate interleaved calls.
pub type LogSink = Arc<dyn Fn(LogStream, String) + Send + Sync>;

/// Resource limits applied to a job's process tree.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// CPU time limit in seconds.
    pub cpu_seconds: u64,
    /// Address space limit in bytes.
    pub memory_bytes: u64,
    /// Process count limit.
    pub pids: u64,
    /// Open file descriptor limit.
    pub nofile: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 300,
            memory_bytes: 1024 * 1024 * 1024,
            pids: 256,
            nofile: 256,
        }
    }
}

/// Everything needed to execute one job command.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The sandbox backend to run under.
    pub sandbox: Sandbox,
    /// The shell command to execute.
    pub command: String,
    /// Wall-clock timeout.
    pub timeout: Duration,
    /// Container image override, when the sandbox is `container`.
    pub image: Option<String>,
    /// Resource limits for the process tree.
    pub limits: SandboxLimits,
}

/// Run a command under the requested sandbox.
///
/// Returns the exit code of the user process, [`EXIT_TIMEOUT`] on a timeout
/// kill, or [`EXIT_CONTAINER_UNUSABLE`] when the container runtime cannot
/// run jobs on this host. Errors are infrastructure failures (spawn, wait);
/// operational problems inside the sandbox surface as `system` log lines
/// and an exit code instead.
pub async fn run_sandbox(
    execution: &Execution,
    container_config: &ContainerConfig,
    on_log: &LogSink,
) -> Result<i32> {
    match execution.sandbox {
        Sandbox::Local => local::run(execution, on_log).await,
        Sandbox::Container => container::run(execution, container_config, on_log).await,
    }
}

/// Spawn a task that pumps one output stream line-by-line into the sink.
///
/// Lines are re-terminated with `\n`; per-stream order is preserved by the
/// single pump, ordering between streams is not.
fn spawn_pump<R>(reader: R, stream: LogStream, on_log: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            on_log(stream, format!("{line}\n"));
        }
    })
}

/// Wait on a spawned child with pumps attached, enforcing the timeout.
///
/// Shared by both backends: drains stdout/stderr concurrently, kills the
/// child and reports [`EXIT_TIMEOUT`] when the deadline passes, then joins
/// the pumps with a bounded grace period so tail output is not lost.
async fn supervise(mut child: Child, timeout: Duration, on_log: &LogSink) -> Result<i32> {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pump(stdout, LogStream::Stdout, on_log.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pump(stderr, LogStream::Stderr, on_log.clone()));
    }

    let code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => {
            let status = result.context("failed to wait for the job child process")?;
            exit_code_of(status, on_log)
        }
        Err(_) => {
            on_log(
                LogStream::System,
                format!("timeout after {}s\n", timeout.as_secs()),
            );
            child.kill().await.ok();
            EXIT_TIMEOUT
        }
    };

    for pump in pumps {
        tokio::time::timeout(PUMP_GRACE, pump).await.ok();
    }

    Ok(code)
}

/// Map an exit status to a numeric code, logging signal terminations.
fn exit_code_of(status: std::process::ExitStatus, on_log: &LogSink) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            on_log(
                LogStream::System,
                format!("process terminated by signal {signal}\n"),
            );
            return 128 + signal;
        }
    }

    1
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// An in-memory sink capturing `(stream, text)` records.
    pub(super) fn memory_sink() -> (LogSink, Arc<Mutex<Vec<(LogStream, String)>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = {
            let records = records.clone();
            Arc::new(move |stream: LogStream, text: String| {
                records.lock().expect("sink lock").push((stream, text));
            })
        };
        (sink, records)
    }

    /// An execution fixture for the local backend.
    pub(super) fn local_execution(command: &str, timeout: Duration) -> Execution {
        Execution {
            sandbox: Sandbox::Local,
            command: command.to_string(),
            timeout,
            image: None,
            limits: SandboxLimits {
                // Generous process budget so shells can fork in test
                // environments that already run many processes.
                pids: 4096,
                nofile: 1024,
                ..Default::default()
            },
        }
    }

    #[test]
    fn default_limits() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.cpu_seconds, 300);
        assert_eq!(limits.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(limits.pids, 256);
        assert_eq!(limits.nofile, 256);
    }
}
