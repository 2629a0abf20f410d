// Logs module - Read access to the apps' captured output

mod reader;

pub use reader::{read_app_logs, read_last_lines, LogLine, LogStream};
