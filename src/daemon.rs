// Daemon - Owns the supervisor and answers control requests

use crate::config::Ecosystem;
use crate::error::Result;
use crate::ipc::{Command, IpcServer, ResponseData};
use crate::logs::read_app_logs;
use crate::process::{Supervisor, SupervisorConfig};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{error, info};

/// The long-running side of the control surface
#[derive(Clone)]
pub struct Daemon {
    supervisor: Supervisor,
    config_path: PathBuf,
    started_at: Instant,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Load the ecosystem file and build a supervisor for it.
    /// Nothing is started yet.
    pub fn load(config_path: &Path, config: SupervisorConfig) -> Result<Self> {
        let ecosystem = Ecosystem::from_file(config_path)?;
        info!(
            config = %config_path.display(),
            apps = ?ecosystem.names(),
            "Loaded configuration"
        );

        Ok(Self {
            supervisor: Supervisor::new(ecosystem, config),
            config_path: config_path.to_path_buf(),
            started_at: Instant::now(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start every configured app, logging the ones that fail
    pub async fn autostart(&self) {
        for outcome in self.supervisor.start_all().await {
            match outcome.error {
                Some(e) => error!(app = %outcome.app, error = %e, "App failed to start"),
                None => info!(app = %outcome.app, instances = outcome.instances, "App started"),
            }
        }
    }

    /// Ask `run` to return, as the `Shutdown` command does
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Execute one control command
    pub async fn handle_command(&self, command: Command) -> Result<ResponseData> {
        match command {
            Command::Start { app } => Ok(ResponseData::Outcomes(
                self.supervisor.start_target(app.as_deref()).await?,
            )),

            Command::Stop { app } => Ok(ResponseData::Outcomes(
                self.supervisor.stop_target(app.as_deref()).await?,
            )),

            Command::Restart { app } => Ok(ResponseData::Outcomes(
                self.supervisor.restart_target(app.as_deref()).await?,
            )),

            Command::Status { app } => Ok(ResponseData::ProcessList(
                self.supervisor.status_target(app.as_deref()).await?,
            )),

            Command::Logs(options) => {
                let app = self.supervisor.descriptor(&options.app).await?;
                Ok(ResponseData::Logs(read_app_logs(&app, options.lines).await?))
            }

            Command::Reload => {
                // An invalid file leaves the running set untouched
                let ecosystem = Ecosystem::from_file(&self.config_path)?;
                info!(config = %self.config_path.display(), "Reloading configuration");
                Ok(ResponseData::Outcomes(self.supervisor.reload(ecosystem).await))
            }

            Command::Ping => Ok(ResponseData::DaemonStatus {
                pid: std::process::id(),
                uptime: self.started_at.elapsed(),
                apps: self.supervisor.apps().await.len(),
            }),

            Command::Shutdown => {
                info!("Shutdown requested by client");
                self.request_shutdown();
                Ok(ResponseData::Success("Daemon shutting down".to_string()))
            }
        }
    }

    /// Serve requests until `signal` resolves or a client asks for a
    /// shutdown, then stop every instance
    pub async fn run<S>(&self, server: &IpcServer, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let daemon = self.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let stop = async move {
            tokio::select! {
                _ = signal => {}
                _ = shutdown.notified() => {}
            }
        };

        let result = server
            .run(
                move |command| {
                    let daemon = daemon.clone();
                    async move { daemon.handle_command(command).await }
                },
                stop,
            )
            .await;

        info!("Stopping all supervised instances");
        self.supervisor.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShepherdError;
    use crate::ipc::LogOptions;
    use crate::process::ProcessState;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, apps: &str) -> PathBuf {
        let path = dir.path().join("ecosystem.config.json");
        std::fs::write(&path, format!(r#"{{"apps": [{}]}}"#, apps)).unwrap();
        path
    }

    fn app_json(name: &str, script: &str) -> String {
        format!(
            r#"{{"name": "{0}", "script": "{1}", "output": "./logs/{0}-out.log", "error": "./logs/{0}-error.log", "kill_timeout_ms": 500}}"#,
            name, script
        )
    }

    fn daemon(path: &Path) -> Daemon {
        Daemon::load(path, SupervisorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"name": "", "script": "sleep 1"}"#);

        assert!(matches!(
            Daemon::load(&path, SupervisorConfig::default()),
            Err(ShepherdError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);

        match daemon.handle_command(Command::Ping).await.unwrap() {
            ResponseData::DaemonStatus { pid, apps, .. } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(apps, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);

        let started = daemon
            .handle_command(Command::Start { app: None })
            .await
            .unwrap();
        match started {
            ResponseData::Outcomes(outcomes) => {
                assert_eq!(outcomes.len(), 1);
                assert!(outcomes[0].is_success());
                assert_eq!(outcomes[0].instances, 1);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match daemon
            .handle_command(Command::Status {
                app: Some("web".to_string()),
            })
            .await
            .unwrap()
        {
            ResponseData::ProcessList(infos) => {
                assert_eq!(infos.len(), 1);
                assert_eq!(infos[0].state, ProcessState::Running);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        daemon
            .handle_command(Command::Stop {
                app: Some("web".to_string()),
            })
            .await
            .unwrap();
        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_app_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);

        let result = daemon
            .handle_command(Command::Restart {
                app: Some("nope".to_string()),
            })
            .await;
        assert!(matches!(result, Err(ShepherdError::AppNotFound(_))));
    }

    #[tokio::test]
    async fn test_logs_reads_configured_files() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);

        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/web-out.log"), "one\ntwo\n").unwrap();

        match daemon
            .handle_command(Command::Logs(LogOptions {
                app: "web".to_string(),
                lines: 1,
            }))
            .await
            .unwrap()
        {
            ResponseData::Logs(lines) => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines[0].text, "two");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reload_rereads_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);
        daemon.autostart().await;

        write_config(
            &dir,
            &format!("{}, {}", app_json("web", "sleep 30"), app_json("worker", "sleep 30")),
        );
        match daemon.handle_command(Command::Reload).await.unwrap() {
            ResponseData::Outcomes(outcomes) => {
                let names: Vec<&str> = outcomes.iter().map(|o| o.app.as_str()).collect();
                assert_eq!(names, vec!["web", "worker"]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(daemon.supervisor().apps().await.len(), 2);

        // A broken file is rejected and changes nothing
        std::fs::write(&path, "{not json").unwrap();
        assert!(daemon.handle_command(Command::Reload).await.is_err());
        assert_eq!(daemon.supervisor().apps().await.len(), 2);

        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_command_ends_run() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &app_json("web", "sleep 30"));
        let daemon = daemon(&path);
        daemon.autostart().await;

        let mut server = IpcServer::with_socket_path(dir.path().join("shepherd.sock"));
        server.start().unwrap();

        let response = daemon.handle_command(Command::Shutdown).await.unwrap();
        assert!(matches!(response, ResponseData::Success(_)));

        // The stored permit makes run return right away
        tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run(&server, std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();

        let infos = daemon.supervisor().status().await;
        assert!(infos.iter().all(|p| p.state.is_terminal()));
    }
}
