// Output formatting and display for CLI

use crate::config::Ecosystem;
use crate::ipc::protocol::{AppOutcome, ProcessInfo, ProcessState, ResponseData};
use crate::logs::{LogLine, LogStream};
use chrono::{DateTime, Local};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout. `action` is the verb used for
/// per-app outcomes.
pub fn print_success(data: &ResponseData, action: &str) {
    match data {
        ResponseData::Outcomes(outcomes) => print_outcomes(outcomes, action),

        ResponseData::ProcessList(processes) => {
            if processes.is_empty() {
                println!("{}", "No instances are managed yet".yellow());
            } else {
                print_process_table(processes);
            }
        }

        ResponseData::Logs(lines) => print_logs(lines),

        ResponseData::DaemonStatus { pid, uptime, apps } => {
            println!("{}", "✓ Daemon is running".green().bold());
            println!("  {}: {}", "PID".bold(), pid);
            println!("  {}: {}", "Uptime".bold(), format_duration(uptime));
            println!("  {}: {}", "Apps".bold(), apps);
        }

        ResponseData::Success(message) => {
            println!("{} {}", "✓".green().bold(), message);
        }
    }
}

fn print_outcomes(outcomes: &[AppOutcome], action: &str) {
    for outcome in outcomes {
        match &outcome.error {
            Some(error) => println!("{} {}: {}", "✗".red().bold(), outcome.app.bold(), error),
            None if outcome.instances == 0 => println!(
                "{} {}: {}",
                "•".blue().bold(),
                outcome.app.bold(),
                "nothing to do".dimmed()
            ),
            None => println!(
                "{} {}: {} {} instance(s)",
                "✓".green().bold(),
                outcome.app.bold(),
                action,
                outcome.instances
            ),
        }
    }
}

/// Print a formatted table of instances, followed by the errors of the
/// failed ones
fn print_process_table(processes: &[ProcessInfo]) {
    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "App")]
        app: String,
        #[tabled(rename = "#")]
        instance: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last Restart")]
        last_restart: String,
    }

    let rows: Vec<ProcessRow> = processes
        .iter()
        .map(|p| ProcessRow {
            id: p.id.to_string(),
            app: truncate(&p.app, 24),
            instance: p.instance.to_string(),
            state: format_state_colored(&p.state),
            pid: p
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpu: format!("{:.1}%", p.cpu_usage),
            memory: format_memory(p.memory_usage),
            uptime: format_duration(&p.uptime),
            restarts: p.restarts.to_string(),
            last_restart: p
                .last_restart
                .map(|at| {
                    let datetime: DateTime<Local> = at.into();
                    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
                })
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);

    for process in processes
        .iter()
        .filter(|p| p.state == ProcessState::Failed)
    {
        if let Some(ref error) = process.last_error {
            println!(
                "{} {}[{}]: {}",
                "✗".red().bold(),
                process.app.bold(),
                process.instance,
                error
            );
        }
    }

    println!(
        "{}",
        format!("Total: {} instance(s)", processes.len())
            .dimmed()
            .italic()
    );
}

fn print_logs(lines: &[LogLine]) {
    if lines.is_empty() {
        println!("{}", "No logs available".yellow());
        return;
    }

    for line in lines {
        match line.stream {
            LogStream::Stdout => println!("{}", line.format()),
            LogStream::Stderr => println!("{}", line.format().red()),
        }
    }
}

/// Print the apps of a validated ecosystem file
pub fn print_ecosystem(ecosystem: &Ecosystem) {
    #[derive(Tabled)]
    struct AppRow {
        #[tabled(rename = "App")]
        name: String,
        #[tabled(rename = "Instances")]
        instances: usize,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Output")]
        output: String,
        #[tabled(rename = "Error")]
        error: String,
    }

    let rows: Vec<AppRow> = ecosystem
        .apps()
        .iter()
        .map(|app| AppRow {
            name: app.name.clone(),
            instances: app.instances,
            command: truncate(&app.script, 40),
            output: app.output.display().to_string(),
            error: app.error.display().to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());

    println!("{}", "✓ Configuration is valid".green().bold());
    println!("\n{}\n", table);
}

/// Format a process state with color coding
fn format_state_colored(state: &ProcessState) -> String {
    match state {
        ProcessState::Running => state.to_string().green().to_string(),
        ProcessState::Starting => state.to_string().yellow().to_string(),
        ProcessState::Stopping => state.to_string().yellow().to_string(),
        ProcessState::Exited => state.to_string().bright_black().to_string(),
        ProcessState::Failed => state.to_string().red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner shown while waiting on the daemon
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_memory(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a very long string", 10), "this is...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_state_colors_keep_label() {
        colored::control::set_override(false);
        assert_eq!(format_state_colored(&ProcessState::Failed), "failed");
        assert_eq!(format_state_colored(&ProcessState::Running), "running");
    }
}
