use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{event, Level};

use crate::ExitReceiver;

/// A hypervisor child process, reaped by a background task.
pub(crate) struct VmProcess {
    label: String,
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    stopped: watch::Receiver<bool>,
}

impl VmProcess {
    /// Spawn `cmd`. Dropping the returned handle kills the process.
    pub fn spawn(label: &str, mut cmd: Command) -> Result<(Self, ExitReceiver)> {
        let mut child = cmd
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {label} process"))?;
        let pid = child.id();
        event!(Level::INFO, ?pid, "{label} process spawned");

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();

        let task_label = label.to_string();
        tokio::spawn(async move {
            #[rustfmt::skip]
            let status = tokio::select! {
                status = child.wait() => status,
                // Explicit kill or handle dropped:
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        event!(Level::WARN, ?e, "Failed to kill {task_label} process");
                    }
                    child.wait().await
                }
            };

            let _ = stopped_tx.send(true);
            let err = match status {
                Ok(status) => anyhow!("{task_label} exited with {status}"),
                Err(e) => anyhow::Error::from(e).context(format!("waiting for {task_label}")),
            };
            event!(Level::INFO, "{err:#}");
            // Nobody listening is fine:
            let _ = exit_tx.send(err);
        });

        Ok((
            VmProcess {
                label: label.to_string(),
                pid,
                kill: Mutex::new(Some(kill_tx)),
                stopped: stopped_rx,
            },
            exit_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn kill(&self) {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            event!(Level::WARN, pid = ?self.pid, "Killing {} process", self.label);
            let _ = sender.send(());
        }
    }

    /// Wait until the process has exited. Returns `false` on timeout.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.clone();
        let stopped_ok = matches!(
            tokio::time::timeout(timeout, stopped.wait_for(|s| *s)).await,
            Ok(Ok(_))
        );
        stopped_ok
    }

    /// Resolves once the process has exited, however long that takes.
    pub async fn exited(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|s| *s).await;
    }

    /// Ask nicely through `request`, then kill once `timeout` has passed.
    /// A stop that needed the kill is reported as an error.
    pub async fn shutdown(&self, request: Result<()>, timeout: Duration) -> Result<()> {
        if let Err(e) = request {
            event!(Level::WARN, "Graceful stop of {} failed, killing: {e:#}", self.label);
            self.kill();
        }

        if self.wait_stopped(timeout).await {
            return Ok(());
        }

        event!(Level::ERROR, "{} timeout while waiting for stop status, force stop", self.label);
        self.kill();
        if self.wait_stopped(Duration::from_secs(5)).await {
            bail!("{} did not stop within {timeout:?} and was killed", self.label)
        } else {
            bail!("{} did not exit after being killed", self.label)
        }
    }
}

/// Run a helper tool to completion, returning its standard output.
pub(crate) async fn run_tool(cmd: &mut Command) -> Result<Vec<u8>> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    event!(Level::DEBUG, ?cmd, "Running {program}");
    cmd.output()
        .await
        .map_err(anyhow::Error::from)
        .and_then(|output| {
            // Ideally we'd want to use the nightly `exit_ok()` here:
            if !output.status.success() {
                bail!(
                    "Running {} failed with exit-code {:?}, stdout: {:?}, stderr: {:?}",
                    program,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr),
                );
            }
            Ok(output.stdout)
        })
}

/// Resolve `name` through `PATH`, then through `fallbacks`.
pub(crate) fn find_binary(name: &str, fallbacks: &[&str]) -> Option<PathBuf> {
    let in_path = std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    });
    in_path.or_else(|| {
        fallbacks
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
    })
}

/// Raise the soft open-files limit to the hard limit; hypervisors hold one
/// descriptor per forwarded connection.
pub(crate) fn raise_nofile_limit() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) if soft < hard => {
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                event!(Level::WARN, soft, hard, ?e, "Failed to raise RLIMIT_NOFILE");
            }
        }
        Ok(_) => (),
        Err(e) => event!(Level::WARN, ?e, "Failed to get RLIMIT_NOFILE"),
    }
}

/// Open a log file for a child's standard output and error.
pub(crate) fn log_stdio(path: &Path) -> Result<(std::process::Stdio, std::process::Stdio)> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {path:?}"))?;
    let err = file
        .try_clone()
        .with_context(|| format!("clone log file handle {path:?}"))?;
    Ok((file.into(), err.into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_of_exited_process() {
        let (process, exit) = VmProcess::spawn("true", Command::new("true")).unwrap();
        let err = exit.await.unwrap();
        assert!(err.to_string().contains("exited"), "{err}");

        process.shutdown(Ok(()), Duration::from_secs(1)).await.unwrap();
        assert!(process.stopped());
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let (process, _exit) = VmProcess::spawn("sleep", cmd).unwrap();

        // The stop request is accepted but ignored.
        let err = process
            .shutdown(Ok(()), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was killed"), "{err}");
        assert!(process.stopped());
    }
}
