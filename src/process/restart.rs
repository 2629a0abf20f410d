use crate::config::AppDescriptor;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Restart policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Exit codes that settle the instance instead of counting as a failure
    pub stop_exit_codes: Vec<i32>,
    /// Maximum number of failures tolerated within the window
    pub max_restarts: usize,
    /// Sliding window for counting failures
    pub window: Duration,
    /// A run at least this long clears the failure history
    pub min_uptime: Duration,
    /// Backoff strategy to use
    pub backoff: Backoff,
}

/// Outcome of evaluating the policy for one observed exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn again after `delay`; `attempt` counts failures in the window
    Respawn { delay: Duration, attempt: usize },
    /// No restart wanted, the instance is done
    Settle,
    /// Too many failures inside the window
    GiveUp { failures: usize },
}

impl RestartPolicy {
    /// Create a new restart policy with default values
    pub fn new() -> Self {
        Self {
            enabled: true,
            stop_exit_codes: Vec::new(),
            max_restarts: 16,
            window: Duration::from_secs(60),
            min_uptime: Duration::from_secs(1),
            backoff: Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(15),
            },
        }
    }

    /// Create a restart policy from an app descriptor
    pub fn from_descriptor(app: &AppDescriptor) -> Self {
        Self {
            enabled: app.autorestart,
            stop_exit_codes: app.stop_exit_codes.clone(),
            max_restarts: app.max_restarts,
            window: app.restart_window(),
            min_uptime: app.min_uptime(),
            backoff: Backoff {
                initial: app.restart_delay(),
                max: app.max_restart_delay(),
            },
        }
    }

    /// Evaluate an exit observed after the instance ran for `uptime`
    pub fn on_exit(
        &self,
        tracker: &mut RestartTracker,
        exit_code: Option<i32>,
        uptime: Duration,
    ) -> RestartDecision {
        self.on_exit_at(tracker, exit_code, uptime, Instant::now())
    }

    pub fn on_exit_at(
        &self,
        tracker: &mut RestartTracker,
        exit_code: Option<i32>,
        uptime: Duration,
        now: Instant,
    ) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::Settle;
        }

        if let Some(code) = exit_code {
            if self.stop_exit_codes.contains(&code) {
                return RestartDecision::Settle;
            }
        }

        // A sustained healthy run resets the backoff
        if uptime >= self.min_uptime {
            tracker.clear();
        }

        self.on_failure_at(tracker, now)
    }

    /// Evaluate a respawn attempt that failed to spawn
    pub fn on_spawn_failure(&self, tracker: &mut RestartTracker) -> RestartDecision {
        self.on_failure_at(tracker, Instant::now())
    }

    fn on_failure_at(&self, tracker: &mut RestartTracker, now: Instant) -> RestartDecision {
        tracker.record_failure_at(now);
        tracker.prune_at(self.window, now);

        let failures = tracker.failure_count();
        if !self.enabled || failures > self.max_restarts {
            return RestartDecision::GiveUp { failures };
        }

        RestartDecision::Respawn {
            delay: self.backoff.calculate_delay(failures - 1),
            attempt: failures,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff between restarts, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Calculate the delay after `previous_failures` failures in the window
    pub fn calculate_delay(&self, previous_failures: usize) -> Duration {
        // delay = initial * 2^previous_failures
        let factor = 2_u32.saturating_pow(previous_failures.min(31) as u32);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Failure history of one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    failures: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure_at(&mut self, at: Instant) {
        self.failures.push_back(at);
    }

    /// Number of failures currently remembered
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }

    /// Forget failures older than `window` relative to `now`
    pub fn prune_at(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
