// Process module - Instance lifecycle, restart policy and supervision

pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
mod types;

pub use monitor::{ProcessMonitor, ResourceSample};
pub use restart::{Backoff, RestartDecision, RestartPolicy, RestartTracker};
pub use spawner::{spawn_instance, spawn_process, SpawnedProcess};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::{ManagedProcess, ProcessId, ProcessState};
