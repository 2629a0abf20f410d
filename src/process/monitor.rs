use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// CPU and memory sample for one process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_usage: f32,
    pub memory_usage: u64,
}

/// Process monitor for collecting resource usage statistics
pub struct ProcessMonitor {
    system: System,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample the given pids. Pids that no longer exist are left out.
    ///
    /// CPU usage is computed against the previous refresh, so the first
    /// sample of a pid reads 0%.
    pub fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ResourceSample> {
        let sys_pids: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::everything(),
        );

        pids.iter()
            .filter_map(|&pid| {
                self.system.process(Pid::from_u32(pid)).map(|process| {
                    (
                        pid,
                        ResourceSample {
                            cpu_usage: process.cpu_usage(),
                            memory_usage: process.memory(),
                        },
                    )
                })
            })
            .collect()
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_current_process() {
        let mut monitor = ProcessMonitor::new();
        let pid = std::process::id();

        let samples = monitor.sample(&[pid]);
        let sample = samples.get(&pid).expect("own process should be visible");
        assert!(sample.memory_usage > 0);
    }

    #[test]
    fn test_sample_skips_missing_pids() {
        let mut monitor = ProcessMonitor::new();
        // Above the default pid_max on Linux
        let samples = monitor.sample(&[4_194_304 + 17]);
        assert!(samples.is_empty());
    }

    #[test]
    fn test_sample_empty() {
        let mut monitor = ProcessMonitor::default();
        assert!(monitor.sample(&[]).is_empty());
    }
}
