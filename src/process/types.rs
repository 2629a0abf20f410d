use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Supervisor-assigned identifier for one managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

impl ProcessState {
    /// Exited and Failed instances are no longer supervised
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Handle used to stop an instance's monitoring task
#[derive(Debug)]
pub(crate) struct InstanceControl {
    pub stop_tx: watch::Sender<bool>,
    pub task: Option<JoinHandle<()>>,
}

impl InstanceControl {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self {
                stop_tx,
                task: None,
            },
            stop_rx,
        )
    }

    pub fn request_stop(&self) {
        // send_replace never fails, even once the monitoring task is gone
        self.stop_tx.send_replace(true);
    }
}

/// One entry of the supervisor's process table
#[derive(Debug)]
pub struct ManagedProcess {
    pub id: ProcessId,
    pub app: String,
    pub instance: usize,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub started_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub restarts: usize,
    pub last_restart: Option<SystemTime>,
    pub last_error: Option<String>,
    pub cpu_usage: f32,
    pub memory_usage: u64,
    pub(crate) control: InstanceControl,
}

impl ManagedProcess {
    pub(crate) fn new(id: ProcessId, app: String, instance: usize, control: InstanceControl) -> Self {
        Self {
            id,
            app,
            instance,
            pid: None,
            state: ProcessState::Starting,
            started_at: None,
            exit_code: None,
            restarts: 0,
            last_restart: None,
            last_error: None,
            cpu_usage: 0.0,
            memory_usage: 0,
            control,
        }
    }

    pub fn uptime(&self) -> Duration {
        match (self.state, self.started_at) {
            (ProcessState::Running | ProcessState::Stopping, Some(started_at)) => {
                SystemTime::now()
                    .duration_since(started_at)
                    .unwrap_or(Duration::from_secs(0))
            }
            _ => Duration::from_secs(0),
        }
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.state = ProcessState::Running;
        self.pid = Some(pid);
        self.started_at = Some(SystemTime::now());
        self.exit_code = None;
    }

    pub fn record_respawn(&mut self, pid: u32) {
        self.restarts += 1;
        self.last_restart = Some(SystemTime::now());
        self.mark_running(pid);
    }

    /// Mark the instance as waiting for a respawn after an exit
    pub fn mark_restarting(&mut self, exit_code: Option<i32>, error: String) {
        self.state = ProcessState::Starting;
        self.pid = None;
        self.exit_code = exit_code;
        self.last_error = Some(error);
        self.clear_usage();
    }

    pub fn mark_stopping(&mut self) {
        self.state = ProcessState::Stopping;
    }

    pub fn mark_exited(&mut self, exit_code: Option<i32>) {
        self.state = ProcessState::Exited;
        self.pid = None;
        self.exit_code = exit_code;
        self.clear_usage();
    }

    pub fn mark_failed(&mut self, exit_code: Option<i32>, error: String) {
        self.state = ProcessState::Failed;
        self.pid = None;
        self.exit_code = exit_code;
        self.last_error = Some(error);
        self.clear_usage();
    }

    fn clear_usage(&mut self) {
        self.cpu_usage = 0.0;
        self.memory_usage = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed() -> ManagedProcess {
        let (control, _rx) = InstanceControl::new();
        ManagedProcess::new(ProcessId::new(1), "svc".to_string(), 0, control)
    }

    #[test]
    fn test_new_entry_is_starting() {
        let process = managed();
        assert_eq!(process.state, ProcessState::Starting);
        assert!(process.pid.is_none());
        assert_eq!(process.uptime(), Duration::from_secs(0));
    }

    #[test]
    fn test_respawn_counts_restarts() {
        let mut process = managed();
        process.mark_running(100);
        process.mark_restarting(Some(1), "exit code 1".to_string());
        assert_eq!(process.state, ProcessState::Starting);
        assert_eq!(process.exit_code, Some(1));
        assert!(process.pid.is_none());

        process.record_respawn(101);
        assert_eq!(process.state, ProcessState::Running);
        assert_eq!(process.pid, Some(101));
        assert_eq!(process.restarts, 1);
        assert!(process.last_restart.is_some());
        assert!(process.exit_code.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessState::Exited.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(!ProcessState::Stopping.is_terminal());
        assert!(!ProcessState::Starting.is_terminal());
    }

    #[test]
    fn test_request_stop_without_receiver() {
        let (control, rx) = InstanceControl::new();
        drop(rx);
        control.request_stop();
        assert!(*control.stop_tx.borrow());
    }
}
