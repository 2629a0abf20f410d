use crate::config::{AppDescriptor, Ecosystem};
use crate::error::{Result, ShepherdError};
use crate::ipc::protocol::{AppOutcome, ProcessInfo};
use crate::process::monitor::ProcessMonitor;
use crate::process::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::process::spawner::{describe_exit, parse_signal, spawn_instance, terminate};
use crate::process::types::{InstanceControl, ManagedProcess, ProcessId, ProcessState};
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashSet};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound for launching one instance
    pub spawn_timeout: Duration,
    /// How often CPU and memory usage are sampled
    pub stats_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(2),
        }
    }
}

/// Keeps the declared number of instances of every app running.
///
/// Each instance is watched by its own monitoring task, which owns the
/// child handle and is the only place that evaluates the restart policy
/// for that instance. The process table holds metadata only, so `status`
/// never waits on a child.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    config: SupervisorConfig,
    apps: RwLock<Vec<Arc<AppDescriptor>>>,
    table: RwLock<BTreeMap<ProcessId, ManagedProcess>>,
    next_id: AtomicU64,
}

impl Supervisor {
    /// Create a supervisor for an explicit, validated descriptor set
    pub fn new(ecosystem: Ecosystem, config: SupervisorConfig) -> Self {
        let apps = ecosystem.into_apps().into_iter().map(Arc::new).collect();
        Self {
            shared: Arc::new(Shared {
                config,
                apps: RwLock::new(apps),
                table: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current descriptors, in configuration order
    pub async fn apps(&self) -> Vec<AppDescriptor> {
        self.shared
            .apps
            .read()
            .await
            .iter()
            .map(|app| (**app).clone())
            .collect()
    }

    pub async fn descriptor(&self, name: &str) -> Result<AppDescriptor> {
        let app = self.app(name).await?;
        Ok(AppDescriptor::clone(&app))
    }

    async fn app(&self, name: &str) -> Result<Arc<AppDescriptor>> {
        self.shared
            .apps
            .read()
            .await
            .iter()
            .find(|app| app.name == name)
            .cloned()
            .ok_or_else(|| ShepherdError::AppNotFound(name.to_string()))
    }

    /// One app by name, or every app when `target` is None
    async fn resolve(&self, target: Option<&str>) -> Result<Vec<Arc<AppDescriptor>>> {
        match target {
            Some(name) => Ok(vec![self.app(name).await?]),
            None => Ok(self.shared.apps.read().await.clone()),
        }
    }

    /// Start the instances of `name` that are not live; returns how many
    /// were launched.
    ///
    /// Returns `Ok(0)` when every instance is already live.
    pub async fn start(&self, name: &str) -> Result<usize> {
        let app = self.app(name).await?;
        self.start_app(app).await
    }

    /// Start every app, one outcome per app in configuration order
    pub async fn start_all(&self) -> Vec<AppOutcome> {
        // resolve(None) cannot fail
        self.start_target(None).await.unwrap_or_default()
    }

    pub async fn start_target(&self, target: Option<&str>) -> Result<Vec<AppOutcome>> {
        let apps = self.resolve(target).await?;
        let mut outcomes = Vec::with_capacity(apps.len());
        for app in apps {
            let name = app.name.clone();
            outcomes.push(AppOutcome::from_result(name, self.start_app(app).await));
        }
        Ok(outcomes)
    }

    async fn start_app(&self, app: Arc<AppDescriptor>) -> Result<usize> {
        // Reserve the entries under one write lock so concurrent starts
        // of the same app cannot both spawn
        let reserved = {
            let mut table = self.shared.table.write().await;
            let live: HashSet<usize> = table
                .values()
                .filter(|p| p.app == app.name && !p.state.is_terminal())
                .map(|p| p.instance)
                .collect();
            let missing: Vec<usize> = (0..app.instances)
                .filter(|instance| !live.contains(instance))
                .collect();
            if missing.is_empty() {
                debug!(app = %app.name, "App already running, nothing to start");
                return Ok(0);
            }

            // Reap settled entries; live siblings keep running
            table.retain(|_, p| p.app != app.name || !p.state.is_terminal());

            let mut reserved = Vec::with_capacity(missing.len());
            for instance in missing {
                let id = ProcessId::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
                let (control, stop_rx) = InstanceControl::new();
                table.insert(
                    id,
                    ManagedProcess::new(id, app.name.clone(), instance, control),
                );
                reserved.push((id, instance, stop_rx));
            }
            reserved
        };

        let requested = reserved.len();
        info!(app = %app.name, instances = requested, "Starting app");

        let mut launched = Vec::with_capacity(reserved.len());
        let mut failures = Vec::new();

        for (id, instance, stop_rx) in reserved {
            match spawn_instance(&app, instance, self.shared.config.spawn_timeout).await {
                Ok(spawned) => {
                    let pid = spawned.pid;
                    let tracked = self
                        .shared
                        .update(id, |p| {
                            let stopping = p.state == ProcessState::Stopping;
                            p.mark_running(pid);
                            if stopping {
                                p.mark_stopping();
                            }
                        })
                        .await;

                    if tracked {
                        info!(app = %app.name, instance, pid, "Instance running");
                        launched.push((id, instance, spawned.child, stop_rx));
                    }
                    // Otherwise the entry was dropped by a reload and the
                    // child is killed when it goes out of scope
                }
                Err(e) => {
                    error!(app = %app.name, instance, error = %e, "Failed to start instance");
                    let message = e.to_string();
                    self.shared
                        .update(id, |p| p.mark_failed(None, message))
                        .await;
                    failures.push(e);
                }
            }
        }

        let started = launched.len();
        for (id, instance, child, stop_rx) in launched {
            let task = tokio::spawn(supervise_instance(
                Arc::clone(&self.shared),
                Arc::clone(&app),
                id,
                instance,
                child,
                stop_rx,
            ));
            self.shared
                .update(id, |p| p.control.task = Some(task))
                .await;
        }

        if failures.is_empty() {
            return Ok(started);
        }
        if requested == 1 {
            return Err(failures.remove(0));
        }

        let reason = match &failures[0] {
            ShepherdError::Spawn { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Err(ShepherdError::spawn(
            &app.name,
            format!(
                "{} of {} instances failed to start: {}",
                failures.len(),
                requested,
                reason
            ),
        ))
    }

    /// Ask every live instance of `name` to stop; returns how many were
    /// asked. Returns before the instances have exited.
    pub async fn stop(&self, name: &str) -> Result<usize> {
        self.app(name).await?;
        Ok(self.request_stop(Some(name)).await.0)
    }

    pub async fn stop_target(&self, target: Option<&str>) -> Result<Vec<AppOutcome>> {
        let apps = self.resolve(target).await?;
        let mut outcomes = Vec::with_capacity(apps.len());
        for app in apps {
            let (stopped, _) = self.request_stop(Some(app.name.as_str())).await;
            outcomes.push(AppOutcome::success(app.name.clone(), stopped));
        }
        Ok(outcomes)
    }

    /// Stop, wait for the instances to exit, and start again
    pub async fn restart(&self, name: &str) -> Result<usize> {
        let app = self.app(name).await?;
        self.restart_app(app).await
    }

    pub async fn restart_target(&self, target: Option<&str>) -> Result<Vec<AppOutcome>> {
        let apps = self.resolve(target).await?;
        let mut outcomes = Vec::with_capacity(apps.len());
        for app in apps {
            let name = app.name.clone();
            outcomes.push(AppOutcome::from_result(name, self.restart_app(app).await));
        }
        Ok(outcomes)
    }

    async fn restart_app(&self, app: Arc<AppDescriptor>) -> Result<usize> {
        info!(app = %app.name, "Restarting app");
        self.stop_and_wait(&app).await;
        self.start_app(app).await
    }

    async fn stop_and_wait(&self, app: &AppDescriptor) {
        let (_, tasks) = self.request_stop(Some(app.name.as_str())).await;
        for task in tasks {
            if let Err(e) = task.await {
                error!(app = %app.name, error = %e, "Monitoring task failed");
            }
        }

        // Instances that were still being launched have no task to join
        let deadline = Instant::now() + app.kill_timeout() + self.shared.config.spawn_timeout;
        while self.has_live_instances(&app.name).await {
            if Instant::now() >= deadline {
                warn!(app = %app.name, "Instances did not settle in time");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn has_live_instances(&self, name: &str) -> bool {
        self.shared
            .table
            .read()
            .await
            .values()
            .any(|p| p.app == name && !p.state.is_terminal())
    }

    /// Mark instances Stopping and signal their monitoring tasks. Returns
    /// how many instances were asked, and the task handles to wait on.
    async fn request_stop(&self, name: Option<&str>) -> (usize, Vec<JoinHandle<()>>) {
        let mut table = self.shared.table.write().await;
        let mut requested = 0;
        let mut tasks = Vec::new();

        for process in table
            .values_mut()
            .filter(|p| name.map_or(true, |n| p.app == n))
            .filter(|p| matches!(p.state, ProcessState::Starting | ProcessState::Running))
        {
            info!(app = %process.app, instance = process.instance, pid = ?process.pid, "Stopping instance");
            process.mark_stopping();
            process.control.request_stop();
            requested += 1;
            if let Some(task) = process.control.task.take() {
                tasks.push(task);
            }
        }

        (requested, tasks)
    }

    /// Snapshot of every managed instance, in configuration order
    pub async fn status(&self) -> Vec<ProcessInfo> {
        let order: Vec<String> = self
            .shared
            .apps
            .read()
            .await
            .iter()
            .map(|app| app.name.clone())
            .collect();

        let mut infos: Vec<ProcessInfo> = self
            .shared
            .table
            .read()
            .await
            .values()
            .map(ProcessInfo::from)
            .collect();

        infos.sort_by_key(|info| {
            let position = order
                .iter()
                .position(|name| *name == info.app)
                .unwrap_or(usize::MAX);
            (position, info.instance, info.id)
        });
        infos
    }

    pub async fn status_target(&self, target: Option<&str>) -> Result<Vec<ProcessInfo>> {
        let infos = self.status().await;
        match target {
            Some(name) => {
                self.app(name).await?;
                Ok(infos.into_iter().filter(|p| p.app == name).collect())
            }
            None => Ok(infos),
        }
    }

    /// Replace the descriptor set.
    ///
    /// Removed apps are stopped and forgotten, changed apps that were live
    /// are restarted, and new apps are started. Apps that were stopped or
    /// gave up stay that way.
    pub async fn reload(&self, ecosystem: Ecosystem) -> Vec<AppOutcome> {
        let new_apps: Vec<Arc<AppDescriptor>> =
            ecosystem.into_apps().into_iter().map(Arc::new).collect();
        let live: HashSet<String> = self
            .shared
            .table
            .read()
            .await
            .values()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.app.clone())
            .collect();
        let old_apps = {
            let mut apps = self.shared.apps.write().await;
            std::mem::replace(&mut *apps, new_apps.clone())
        };

        for old in &old_apps {
            if !new_apps.iter().any(|app| app.name == old.name) {
                info!(app = %old.name, "App removed from configuration");
                self.stop_and_wait(old).await;
                self.shared
                    .table
                    .write()
                    .await
                    .retain(|_, p| p.app != old.name);
            }
        }

        let mut outcomes = Vec::with_capacity(new_apps.len());
        for app in new_apps {
            let previous = old_apps.iter().find(|old| old.name == app.name);
            let name = app.name.clone();
            let result = match previous {
                None => self.start_app(app).await,
                Some(old) if **old != *app && live.contains(&name) => {
                    self.restart_app(app).await
                }
                Some(_) => {
                    debug!(app = %name, "Leaving app as it is");
                    Ok(0)
                }
            };
            outcomes.push(AppOutcome::from_result(name, result));
        }
        outcomes
    }

    /// Stop everything and wait for all monitoring tasks to finish
    pub async fn shutdown(&self) {
        let (requested, tasks) = self.request_stop(None).await;
        info!(instances = requested, "Shutting down supervised instances");
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Monitoring task failed during shutdown");
            }
        }
    }

    /// Sample CPU and memory for every running instance
    pub async fn refresh_stats(&self, monitor: &mut ProcessMonitor) {
        let pids: Vec<u32> = self
            .shared
            .table
            .read()
            .await
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .filter_map(|p| p.pid)
            .collect();

        if pids.is_empty() {
            return;
        }

        let samples = monitor.sample(&pids);

        let mut table = self.shared.table.write().await;
        for process in table.values_mut() {
            if let Some(sample) = process.pid.and_then(|pid| samples.get(&pid)) {
                process.cpu_usage = sample.cpu_usage;
                process.memory_usage = sample.memory_usage;
            }
        }
    }

    /// Periodically refresh resource usage in the background
    pub fn spawn_stats_task(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut monitor = ProcessMonitor::new();
            let mut interval = tokio::time::interval(supervisor.shared.config.stats_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                supervisor.refresh_stats(&mut monitor).await;
            }
        })
    }
}

impl Shared {
    /// Apply `f` to an entry; false when the entry no longer exists
    async fn update<F>(&self, id: ProcessId, f: F) -> bool
    where
        F: FnOnce(&mut ManagedProcess),
    {
        match self.table.write().await.get_mut(&id) {
            Some(process) => {
                f(process);
                true
            }
            None => false,
        }
    }

    async fn finish_stop(
        &self,
        id: ProcessId,
        app: &str,
        instance: usize,
        result: Result<ExitStatus>,
    ) {
        match result {
            Ok(status) => {
                info!(app, instance, status = %describe_exit(&status), "Instance stopped");
                self.update(id, |p| p.mark_exited(status.code())).await;
            }
            Err(e) => {
                error!(app, instance, error = %e, "Failed to stop instance cleanly");
                let message = e.to_string();
                self.update(id, |p| {
                    p.mark_exited(None);
                    p.last_error = Some(message);
                })
                .await;
            }
        }
    }
}

/// Resolves once a stop was requested or the instance's entry was dropped
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Monitoring loop of one instance: wait for an exit or a stop request,
/// then apply the restart policy. Every exit is handled here exactly once.
async fn supervise_instance(
    shared: Arc<Shared>,
    app: Arc<AppDescriptor>,
    id: ProcessId,
    instance: usize,
    mut child: Child,
    mut stop_rx: watch::Receiver<bool>,
) {
    let policy = RestartPolicy::from_descriptor(&app);
    let stop_signal = parse_signal(&app.kill_signal).unwrap_or(Signal::SIGTERM);
    let mut tracker = RestartTracker::new();

    loop {
        let started = Instant::now();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = stop_requested(&mut stop_rx) => {
                let result = terminate(&mut child, stop_signal, app.kill_timeout()).await;
                shared.finish_stop(id, &app.name, instance, result).await;
                return;
            }
        };

        // A stop request that raced with the exit wins
        if *stop_rx.borrow() {
            shared
                .finish_stop(id, &app.name, instance, status.map_err(ShepherdError::from))
                .await;
            return;
        }

        let (exit_code, detail) = match &status {
            Ok(status) => (status.code(), describe_exit(status)),
            Err(e) => (None, format!("wait failed: {}", e)),
        };
        let mut last_error = ShepherdError::RuntimeExit {
            app: app.name.clone(),
            instance,
            detail: detail.clone(),
        }
        .to_string();

        let mut decision = policy.on_exit(&mut tracker, exit_code, started.elapsed());

        loop {
            match decision {
                RestartDecision::Settle => {
                    info!(app = %app.name, instance, %detail, "Instance exited, not restarting");
                    shared.update(id, |p| p.mark_exited(exit_code)).await;
                    return;
                }
                RestartDecision::GiveUp { failures } => {
                    error!(
                        app = %app.name,
                        instance,
                        failures,
                        "Instance failed too often within the restart window, giving up"
                    );
                    shared
                        .update(id, |p| p.mark_failed(exit_code, last_error))
                        .await;
                    return;
                }
                RestartDecision::Respawn { delay, attempt } => {
                    warn!(
                        app = %app.name,
                        instance,
                        %detail,
                        attempt,
                        ?delay,
                        "Instance exited, scheduling restart"
                    );
                    let message = last_error.clone();
                    shared
                        .update(id, |p| {
                            if p.state != ProcessState::Stopping {
                                p.mark_restarting(exit_code, message);
                            }
                        })
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_requested(&mut stop_rx) => {
                            info!(app = %app.name, instance, "Restart cancelled by stop");
                            shared.update(id, |p| p.mark_exited(exit_code)).await;
                            return;
                        }
                    }

                    match spawn_instance(&app, instance, shared.config.spawn_timeout).await {
                        Ok(spawned) => {
                            let pid = spawned.pid;
                            child = spawned.child;
                            let tracked = shared
                                .update(id, |p| {
                                    let stopping = p.state == ProcessState::Stopping;
                                    p.record_respawn(pid);
                                    if stopping {
                                        p.mark_stopping();
                                    }
                                })
                                .await;
                            if !tracked {
                                // Entry dropped; the child dies with its handle
                                return;
                            }
                            info!(app = %app.name, instance, pid, "Instance restarted");
                            break;
                        }
                        Err(e) => {
                            warn!(app = %app.name, instance, error = %e, "Restart attempt failed");
                            last_error = e.to_string();
                            decision = policy.on_spawn_failure(&mut tracker);
                        }
                    }
                }
            }
        }
    }
}
