use crate::config::AppDescriptor;
use crate::error::{Result, ShepherdError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Which file a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of an app's captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    /// Format the line for display
    pub fn format(&self) -> String {
        let prefix = match self.stream {
            LogStream::Stdout => "[OUT]",
            LogStream::Stderr => "[ERR]",
        };
        format!("{} {}", prefix, self.text)
    }
}

/// Read the last `lines` lines of a log file.
///
/// A missing file reads as empty: the app may simply not have written yet.
pub async fn read_last_lines(path: &Path, lines: usize, stream: LogStream) -> Result<Vec<LogLine>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ShepherdError::LogError(format!(
                "Failed to open log file {}: {}",
                path.display(),
                e
            )))
        }
    };

    let mut tail = VecDeque::with_capacity(lines.min(1024));
    let mut reader = BufReader::new(file).lines();
    while let Some(line) = reader.next_line().await.map_err(|e| {
        ShepherdError::LogError(format!("Failed to read {}: {}", path.display(), e))
    })? {
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Ok(tail
        .into_iter()
        .map(|text| LogLine { stream, text })
        .collect())
}

/// Tail of an app's stdout file followed by the tail of its stderr file
pub async fn read_app_logs(app: &AppDescriptor, lines: usize) -> Result<Vec<LogLine>> {
    let mut entries = read_last_lines(&app.output, lines, LogStream::Stdout).await?;
    entries.extend(read_last_lines(&app.error, lines, LogStream::Stderr).await?);
    Ok(entries)
}
