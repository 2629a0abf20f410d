// CLI module - User-facing command-line interface

mod output;

use crate::config::Ecosystem;
use crate::error::{Result, ShepherdError};
use crate::ipc::client::IpcClient;
use crate::ipc::protocol::{Command, LogOptions, ProcessState, ResponseData};
use crate::ipc::DEFAULT_SOCKET_PATH;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Shepherd - keeps the apps of an ecosystem file running
#[derive(Parser, Debug)]
#[command(name = "shepherd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Daemon control socket
    #[arg(
        short,
        long,
        global = true,
        env = "SHEPHERD_SOCKET",
        default_value = DEFAULT_SOCKET_PATH
    )]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start an app (all apps when omitted)
    Start { app: Option<String> },

    /// Stop an app (all apps when omitted)
    Stop { app: Option<String> },

    /// Restart an app (all apps when omitted)
    Restart { app: Option<String> },

    /// Show managed instances
    Status { app: Option<String> },

    /// Show the tail of an app's output files
    Logs {
        app: String,

        /// Number of lines per file
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Re-read the daemon's config file and apply it
    Reload,

    /// Check that the daemon is up
    Ping,

    /// Stop every instance and shut the daemon down
    Kill,

    /// Check an ecosystem file without contacting the daemon
    Validate { file: PathBuf },
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute()
    }

    /// Execute the parsed command
    fn execute(&self) -> Result<()> {
        let Some(command) = self.build_command() else {
            return match &self.command {
                Commands::Validate { file } => validate(file),
                _ => Ok(()),
            };
        };
        let client = IpcClient::with_socket_path(&self.socket);

        let spinner = self.progress_message().map(output::create_progress_bar);
        let result = client.call(command);
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }

        let data = result?;
        output::print_success(&data, self.action());
        check_response(&data)
    }

    /// Build an IPC command from the CLI arguments; None for commands
    /// that run locally
    fn build_command(&self) -> Option<Command> {
        let command = match &self.command {
            Commands::Start { app } => Command::Start { app: app.clone() },
            Commands::Stop { app } => Command::Stop { app: app.clone() },
            Commands::Restart { app } => Command::Restart { app: app.clone() },
            Commands::Status { app } => Command::Status { app: app.clone() },
            Commands::Logs { app, lines } => Command::Logs(LogOptions {
                app: app.clone(),
                lines: *lines,
            }),
            Commands::Reload => Command::Reload,
            Commands::Ping => Command::Ping,
            Commands::Kill => Command::Shutdown,
            Commands::Validate { .. } => return None,
        };
        Some(command)
    }

    /// Verb used when reporting per-app outcomes
    fn action(&self) -> &'static str {
        match self.command {
            Commands::Start { .. } => "started",
            Commands::Stop { .. } => "stopping",
            Commands::Restart { .. } => "restarted",
            Commands::Reload => "reloaded",
            _ => "done",
        }
    }

    fn progress_message(&self) -> Option<&'static str> {
        match self.command {
            Commands::Start { .. } => Some("Starting..."),
            Commands::Restart { .. } => Some("Restarting..."),
            Commands::Reload => Some("Reloading configuration..."),
            Commands::Kill => Some("Stopping daemon..."),
            _ => None,
        }
    }
}

/// Turn failures reported inside a successful response into an error, so
/// the process exits non-zero
fn check_response(data: &ResponseData) -> Result<()> {
    match data {
        ResponseData::Outcomes(outcomes) => {
            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            if failed > 0 {
                return Err(ShepherdError::Other(format!("{} app(s) failed", failed)));
            }
        }
        ResponseData::ProcessList(processes) => {
            let failed = processes
                .iter()
                .filter(|p| p.state == ProcessState::Failed)
                .count();
            if failed > 0 {
                return Err(ShepherdError::Other(format!(
                    "{} instance(s) in failed state",
                    failed
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let ecosystem = Ecosystem::from_file(file)?;
    output::print_ecosystem(&ecosystem);
    Ok(())
}
