// Drives a daemon over its socket the way the CLI does

use shepherd::daemon::Daemon;
use shepherd::error::Result;
use shepherd::ipc::{Command, IpcClient, IpcServer, LogOptions, ResponseData};
use shepherd::process::{ProcessState, SupervisorConfig};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

async fn call(socket_path: &Path, command: Command) -> Result<ResponseData> {
    let socket_path = socket_path.to_path_buf();
    tokio::task::spawn_blocking(move || IpcClient::with_socket_path(socket_path).call(command))
        .await
        .unwrap()
}

fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("ecosystem.config.json");
    std::fs::write(
        &path,
        r#"{"apps": [
            {"name": "web", "script": "/bin/sh -c 'echo listening; exec sleep 30'", "instances": 2},
            {"name": "once", "script": "true", "stop_exit_codes": [0]}
        ]}"#,
    )
    .unwrap();
    path
}

#[tokio::test]
async fn test_daemon_over_socket() {
    let dir = TempDir::new().unwrap();
    let config_path = write_config(&dir);
    let socket_path = dir.path().join("shepherd.sock");

    let daemon = Daemon::load(&config_path, SupervisorConfig::default()).unwrap();
    let mut server = IpcServer::with_socket_path(&socket_path);
    server.start().unwrap();

    let runner = daemon.clone();
    let handle = tokio::spawn(async move {
        let result = runner.run(&server, std::future::pending()).await;
        drop(server);
        result
    });

    // Ping before anything is started
    match call(&socket_path, Command::Ping).await.unwrap() {
        ResponseData::DaemonStatus { pid, apps, .. } => {
            assert_eq!(pid, std::process::id());
            assert_eq!(apps, 2);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Start everything
    match call(&socket_path, Command::Start { app: None }).await.unwrap() {
        ResponseData::Outcomes(outcomes) => {
            assert_eq!(outcomes.len(), 2);
            assert!(outcomes.iter().all(|o| o.is_success()));
            assert_eq!(outcomes[0].instances, 2);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Status of one app
    match call(&socket_path, Command::Status { app: Some("web".to_string()) })
        .await
        .unwrap()
    {
        ResponseData::ProcessList(infos) => {
            assert_eq!(infos.len(), 2);
            assert!(infos.iter().all(|p| p.state == ProcessState::Running));
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Output reaches the configured file and the logs command
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lines = match call(
            &socket_path,
            Command::Logs(LogOptions {
                app: "web".to_string(),
                lines: 10,
            }),
        )
        .await
        .unwrap()
        {
            ResponseData::Logs(lines) => lines,
            other => panic!("unexpected response: {:?}", other),
        };
        if lines.iter().filter(|l| l.text == "listening").count() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "missing output: {:?}", lines);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Unknown apps are reported as errors
    assert!(call(&socket_path, Command::Stop { app: Some("ghost".to_string()) })
        .await
        .is_err());

    // Kill stops the daemon and every instance
    match call(&socket_path, Command::Shutdown).await.unwrap() {
        ResponseData::Success(_) => {}
        other => panic!("unexpected response: {:?}", other),
    }

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let infos = daemon.supervisor().status().await;
    assert!(infos.iter().all(|p| p.state.is_terminal()));
    assert!(!socket_path.exists());
}
