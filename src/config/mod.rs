use crate::error::{Result, ShepherdError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted for `kill_signal`
pub const VALID_SIGNALS: &[&str] = &[
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Description of one supervised app, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// App name (unique identifier)
    pub name: String,

    /// Launch command: executable followed by its arguments
    pub script: String,

    /// Extra arguments appended after the ones in `script`
    pub args: Vec<String>,

    /// Number of instances to keep running
    pub instances: usize,

    /// File receiving the instances' standard output
    pub output: PathBuf,

    /// File receiving the instances' standard error
    pub error: PathBuf,

    /// Working directory for the instances
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Whether exits are evaluated for a respawn at all
    pub autorestart: bool,

    /// Exit codes that end supervision instead of counting as failures
    pub stop_exit_codes: Vec<i32>,

    /// Failures tolerated inside the restart window before giving up
    pub max_restarts: usize,

    /// Sliding window for counting failures (in seconds)
    pub restart_window_secs: u64,

    /// A run at least this long clears the failure history (in milliseconds)
    pub min_uptime_ms: u64,

    /// Base backoff delay (in milliseconds)
    pub restart_delay_ms: u64,

    /// Backoff cap (in milliseconds)
    pub max_restart_delay_ms: u64,

    /// Signal sent on stop
    pub kill_signal: String,

    /// Grace period before SIGKILL (in milliseconds)
    pub kill_timeout_ms: u64,
}

// Defaults follow PM2's ecosystem semantics
const DEFAULT_MAX_RESTARTS: usize = 16;
const DEFAULT_RESTART_WINDOW_SECS: u64 = 60;
const DEFAULT_MIN_UPTIME_MS: u64 = 1000;
const DEFAULT_RESTART_DELAY_MS: u64 = 100;
const DEFAULT_MAX_RESTART_DELAY_MS: u64 = 15_000;
const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";
const DEFAULT_KILL_TIMEOUT_MS: u64 = 1600;

impl AppDescriptor {
    /// Create a descriptor with default supervision settings and log paths
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            output: default_output(&name),
            error: default_error(&name),
            name,
            script: script.into(),
            args: Vec::new(),
            instances: 1,
            cwd: None,
            env: BTreeMap::new(),
            autorestart: true,
            stop_exit_codes: Vec::new(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_window_secs: DEFAULT_RESTART_WINDOW_SECS,
            min_uptime_ms: DEFAULT_MIN_UPTIME_MS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            max_restart_delay_ms: DEFAULT_MAX_RESTART_DELAY_MS,
            kill_signal: DEFAULT_KILL_SIGNAL.to_string(),
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
        }
    }

    /// Split the launch command into program and arguments
    pub fn command(&self) -> Result<(String, Vec<String>)> {
        let mut parts = shell_words::split(&self.script)
            .map_err(|e| ShepherdError::validation("script", e.to_string()))?;
        if parts.is_empty() {
            return Err(ShepherdError::validation("script", "must not be empty"));
        }
        let program = parts.remove(0);
        parts.extend(self.args.iter().cloned());
        Ok((program, parts))
    }

    /// Validate the descriptor, naming fields relative to `prefix`
    pub fn validate(&self, prefix: &str) -> Result<()> {
        let field = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            }
        };

        if self.name.trim().is_empty() {
            return Err(ShepherdError::validation(field("name"), "must not be empty"));
        }

        match shell_words::split(&self.script) {
            Ok(parts) if parts.is_empty() => {
                return Err(ShepherdError::validation(field("script"), "must not be empty"));
            }
            Err(e) => {
                return Err(ShepherdError::validation(field("script"), e.to_string()));
            }
            Ok(_) => {}
        }

        if self.instances == 0 {
            return Err(ShepherdError::validation(
                field("instances"),
                "must be at least 1",
            ));
        }

        if !VALID_SIGNALS.contains(&self.kill_signal.as_str()) {
            return Err(ShepherdError::validation(
                field("kill_signal"),
                format!(
                    "{} is not one of: {}",
                    self.kill_signal,
                    VALID_SIGNALS.join(", ")
                ),
            ));
        }

        if self.max_restart_delay_ms < self.restart_delay_ms {
            return Err(ShepherdError::validation(
                field("max_restart_delay_ms"),
                "must not be smaller than restart_delay_ms",
            ));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(ShepherdError::validation(
                    field("cwd"),
                    format!("{} is not an existing directory", cwd.display()),
                ));
            }
        }

        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_millis(self.max_restart_delay_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

fn default_output(name: &str) -> PathBuf {
    PathBuf::from(format!("logs/{}-out.log", name))
}

fn default_error(name: &str) -> PathBuf {
    PathBuf::from(format!("logs/{}-error.log", name))
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
    /// `module.exports = { ... }` with a JSON object literal body
    JavaScript,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "json" => Ok(ConfigFormat::Json),
            "toml" => Ok(ConfigFormat::Toml),
            "js" | "cjs" => Ok(ConfigFormat::JavaScript),
            _ => Err(ShepherdError::ConfigError(format!(
                "Unsupported file format: '{}'. Use .json, .toml or .js",
                extension
            ))),
        }
    }
}

/// The validated, ordered set of app descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    apps: Vec<AppDescriptor>,
    source: Option<PathBuf>,
}

impl Ecosystem {
    /// Build an ecosystem from descriptors, validating each and their names
    pub fn new(apps: Vec<AppDescriptor>) -> Result<Self> {
        if apps.is_empty() {
            return Err(ShepherdError::validation(
                "apps",
                "must declare at least one app",
            ));
        }

        let mut seen = HashSet::new();
        for (index, app) in apps.iter().enumerate() {
            let prefix = format!("apps[{}]", index);
            app.validate(&prefix)?;
            if !seen.insert(app.name.as_str()) {
                return Err(ShepherdError::validation(
                    format!("{}.name", prefix),
                    format!("duplicate app name '{}'", app.name),
                ));
            }
        }

        Ok(Self { apps, source: None })
    }

    /// Load an ecosystem file; relative paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ShepherdError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let format = ConfigFormat::from_path(path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut ecosystem = Self::parse(&contents, format, Some(&base_dir))?;
        ecosystem.source = Some(path.to_path_buf());
        Ok(ecosystem)
    }

    /// Parse ecosystem contents in the given format
    pub fn parse(contents: &str, format: ConfigFormat, base_dir: Option<&Path>) -> Result<Self> {
        let raw: RawEcosystem = match format {
            ConfigFormat::Json => serde_json::from_str(contents).map_err(|e| {
                ShepherdError::ConfigError(format!("Failed to parse JSON: {}", e))
            })?,
            ConfigFormat::Toml => toml::from_str(contents).map_err(|e| {
                ShepherdError::ConfigError(format!("Failed to parse TOML: {}", e))
            })?,
            ConfigFormat::JavaScript => {
                let body = strip_module_exports(contents)?;
                serde_json::from_str(body).map_err(|e| {
                    ShepherdError::ConfigError(format!(
                        "Failed to parse module.exports object: {}",
                        e
                    ))
                })?
            }
        };

        let apps = raw
            .apps
            .into_iter()
            .enumerate()
            .map(|(index, app)| app.into_descriptor(index, base_dir))
            .collect::<Result<Vec<_>>>()?;

        Self::new(apps)
    }

    pub fn apps(&self) -> &[AppDescriptor] {
        &self.apps
    }

    pub fn into_apps(self) -> Vec<AppDescriptor> {
        self.apps
    }

    pub fn get(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.iter().find(|app| app.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.apps.iter().map(|app| app.name.as_str()).collect()
    }

    /// File this ecosystem was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Strip the `module.exports =` wrapper of a JavaScript ecosystem file
fn strip_module_exports(contents: &str) -> Result<&str> {
    let body = contents
        .trim()
        .strip_prefix("module.exports")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| {
            ShepherdError::ConfigError(
                "JavaScript config must start with 'module.exports ='".to_string(),
            )
        })?;

    let body = body.trim();
    Ok(body.strip_suffix(';').unwrap_or(body).trim_end())
}

#[derive(Debug, Deserialize)]
struct RawEcosystem {
    #[serde(default)]
    apps: Vec<RawApp>,
}

/// App entry as written in the file, before defaults and validation
#[derive(Debug, Deserialize)]
struct RawApp {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    args: Option<StringOrList>,
    #[serde(default)]
    instances: Option<InstanceCount>,
    #[serde(default, alias = "out_file")]
    output: Option<String>,
    #[serde(default, alias = "error_file")]
    error: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    autorestart: Option<bool>,
    #[serde(default)]
    stop_exit_codes: Option<Vec<i32>>,
    #[serde(default)]
    max_restarts: Option<usize>,
    #[serde(default)]
    restart_window_secs: Option<u64>,
    #[serde(default, alias = "min_uptime")]
    min_uptime_ms: Option<u64>,
    #[serde(default, alias = "restart_delay")]
    restart_delay_ms: Option<u64>,
    #[serde(default)]
    max_restart_delay_ms: Option<u64>,
    #[serde(default)]
    kill_signal: Option<String>,
    #[serde(default, alias = "kill_timeout")]
    kill_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    Single(String),
    List(Vec<String>),
}

/// `instances` may be a number, a numeric string or "max"
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InstanceCount {
    Number(i64),
    Text(String),
}

impl InstanceCount {
    fn resolve(&self, field: &str) -> Result<usize> {
        let count = match self {
            InstanceCount::Number(n) => *n,
            InstanceCount::Text(text) if text.trim().eq_ignore_ascii_case("max") => {
                return Ok(std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1));
            }
            InstanceCount::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                ShepherdError::validation(field, format!("'{}' is not a number", text))
            })?,
        };

        if count < 1 {
            return Err(ShepherdError::validation(field, "must be at least 1"));
        }
        Ok(count as usize)
    }
}

/// Environment values may be written as strings, numbers or booleans
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            EnvValue::Text(s) => s,
            EnvValue::Integer(n) => n.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Bool(b) => b.to_string(),
        }
    }
}

impl RawApp {
    fn into_descriptor(self, index: usize, base_dir: Option<&Path>) -> Result<AppDescriptor> {
        let prefix = format!("apps[{}]", index);

        let name = self
            .name
            .ok_or_else(|| ShepherdError::validation(format!("{}.name", prefix), "is required"))?;
        let script = self.script.ok_or_else(|| {
            ShepherdError::validation(format!("{}.script", prefix), "is required")
        })?;

        let mut app = AppDescriptor::new(name, expand_env(&script));

        if let Some(args) = self.args {
            app.args = match args {
                StringOrList::Single(s) => shell_words::split(&s).map_err(|e| {
                    ShepherdError::validation(format!("{}.args", prefix), e.to_string())
                })?,
                StringOrList::List(list) => list,
            };
        }

        if let Some(instances) = self.instances {
            app.instances = instances.resolve(&format!("{}.instances", prefix))?;
        }

        app.output = resolve_path(
            base_dir,
            self.output
                .map(|p| PathBuf::from(expand_env(&p)))
                .unwrap_or_else(|| default_output(&app.name)),
        );
        app.error = resolve_path(
            base_dir,
            self.error
                .map(|p| PathBuf::from(expand_env(&p)))
                .unwrap_or_else(|| default_error(&app.name)),
        );
        app.cwd = self
            .cwd
            .map(|p| resolve_path(base_dir, PathBuf::from(expand_env(&p))));

        app.env = self
            .env
            .into_iter()
            .map(|(k, v)| (k, expand_env(&v.into_string())))
            .collect();

        if let Some(autorestart) = self.autorestart {
            app.autorestart = autorestart;
        }
        if let Some(codes) = self.stop_exit_codes {
            app.stop_exit_codes = codes;
        }
        if let Some(max_restarts) = self.max_restarts {
            app.max_restarts = max_restarts;
        }
        if let Some(window) = self.restart_window_secs {
            app.restart_window_secs = window;
        }
        if let Some(min_uptime) = self.min_uptime_ms {
            app.min_uptime_ms = min_uptime;
        }
        if let Some(delay) = self.restart_delay_ms {
            app.restart_delay_ms = delay;
        }
        if let Some(max_delay) = self.max_restart_delay_ms {
            app.max_restart_delay_ms = max_delay;
        }
        if let Some(signal) = self.kill_signal {
            app.kill_signal = signal;
        }
        if let Some(timeout) = self.kill_timeout_ms {
            app.kill_timeout_ms = timeout;
        }

        Ok(app)
    }
}

fn resolve_path(base_dir: Option<&Path>, path: PathBuf) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

/// Expand `$VAR` and `${VAR}` from the process environment.
/// Unknown variables are left as written.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(inner) = after.strip_prefix('{') {
            if let Some(end) = inner.find('}') {
                match std::env::var(&inner[..end]) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[pos..pos + end + 3]),
                }
                rest = &inner[end + 1..];
                continue;
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len > 0 {
                match std::env::var(&after[..len]) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&rest[pos..pos + len + 1]),
                }
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }

    out.push_str(rest);
    out
}
