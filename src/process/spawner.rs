use crate::config::AppDescriptor;
use crate::error::{Result, ShepherdError};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::process::{Child, Command};

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn one instance of an app, failing with `SpawnError` after `timeout`
pub async fn spawn_instance(
    app: &AppDescriptor,
    instance: usize,
    timeout: Duration,
) -> Result<SpawnedProcess> {
    match tokio::time::timeout(timeout, spawn_process(app, instance)).await {
        Ok(result) => result,
        Err(_) => Err(ShepherdError::spawn(
            &app.name,
            format!("timed out after {:?}", timeout),
        )),
    }
}

/// Spawn a process for the given app descriptor
///
/// The child gets:
/// - stdout/stderr appended to the app's log files (created if absent)
/// - its own process group, so stop signals reach its children too
/// - `SHEPHERD_APP_NAME` and `SHEPHERD_INSTANCE` in its environment
pub async fn spawn_process(app: &AppDescriptor, instance: usize) -> Result<SpawnedProcess> {
    let (program, args) = app
        .command()
        .map_err(|e| ShepherdError::spawn(&app.name, e.to_string()))?;

    let stdout = open_log(&app.output)
        .await
        .map_err(|e| ShepherdError::spawn(&app.name, e.to_string()))?;
    let stderr = open_log(&app.error)
        .await
        .map_err(|e| ShepherdError::spawn(&app.name, e.to_string()))?;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(&app.env)
        .env("SHEPHERD_APP_NAME", &app.name)
        .env("SHEPHERD_INSTANCE", instance.to_string())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .kill_on_drop(true);

    if let Some(ref cwd) = app.cwd {
        command.current_dir(cwd);
    }

    let child = command.spawn().map_err(|e| {
        ShepherdError::spawn(&app.name, format!("failed to execute '{}': {}", program, e))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| ShepherdError::spawn(&app.name, "failed to get PID"))?;

    Ok(SpawnedProcess { child, pid })
}

/// Open a log file in append mode, creating it and its parent directory
async fn open_log(path: &Path) -> Result<Stdio> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ShepherdError::LogError(format!(
                "Failed to create log directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            ShepherdError::LogError(format!(
                "Failed to open log file {}: {}",
                path.display(),
                e
            ))
        })?;

    Ok(Stdio::from(file.into_std().await))
}

pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(ShepherdError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

/// Gracefully terminate a child: signal its process group, wait up to
/// `grace`, then SIGKILL. Returns the exit status once reaped.
pub async fn terminate(
    child: &mut Child,
    stop_signal: Signal,
    grace: Duration,
) -> Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(child.wait().await?);
    };
    let group = Pid::from_raw(pid as i32);

    tracing::debug!(pid, signal = %stop_signal, "Sending stop signal to process group");
    if let Err(e) = signal::killpg(group, stop_signal) {
        // The leader may have exited already; fall back to the single pid
        tracing::debug!(pid, error = %e, "killpg failed, signalling pid directly");
        let _ = signal::kill(group, stop_signal);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            tracing::warn!(pid, "Process did not exit within {:?}, sending SIGKILL", grace);
            let _ = signal::killpg(group, Signal::SIGKILL);
            child.kill().await.or_else(|e| {
                // InvalidInput means the child was reaped in the meantime
                if e.kind() == std::io::ErrorKind::InvalidInput {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
            Ok(child.wait().await?)
        }
    }
}

/// Describe how a process ended, for logs and `last_error`
pub fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(sig)) => match Signal::try_from(sig) {
            Ok(signal) => format!("killed by {}", signal),
            Err(_) => format!("killed by signal {}", sig),
        },
        (None, None) => "unknown exit status".to_string(),
    }
}
