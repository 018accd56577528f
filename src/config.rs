use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Header carrying the shared secret on forwarded requests and probes
pub const SHARED_SECRET_HEADER: &str = "x-shared-secret";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The write and read routes
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Startup and idle-shutdown timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// External start/stop commands
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address both routes listen on (default: 127.0.0.1)
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Value injected as `x-shared-secret` when the caller did not send one
    pub shared_secret: Option<String>,

    /// Maximum idle pooled connections per target port
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            shared_secret: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    /// The shared secret, treating an empty string as unset
    pub fn shared_secret(&self) -> Option<&str> {
        self.shared_secret.as_deref().filter(|s| !s.is_empty())
    }
}

/// One external listen port paired with one backend target port
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RouteConfig {
    pub listen_port: u16,
    pub target_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutesConfig {
    #[serde(default = "default_write_route")]
    pub write: RouteConfig,

    #[serde(default = "default_read_route")]
    pub read: RouteConfig,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            write: default_write_route(),
            read: default_read_route(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds without traffic before the cluster is stopped (<= 0 disables)
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: i64,

    /// Overall deadline for one startup operation
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Delay between probe attempts while starting
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Per-attempt network timeout for a probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Tick of the idle-shutdown loop
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,

    /// Stop the cluster when the proxy itself shuts down
    #[serde(default)]
    pub stop_on_exit: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_seconds: default_idle_seconds(),
            startup_timeout_ms: default_startup_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            stop_on_exit: false,
        }
    }
}

impl LifecycleConfig {
    /// Idle timeout, or `None` when idle shutdown is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        u64::try_from(self.idle_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}

/// How the backend cluster is started and stopped
///
/// # Security Warning
///
/// The start and stop commands are executed directly with the permissions of
/// the proxy process. Protect the configuration file and environment accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Compose file used by the default commands
    #[serde(default = "default_compose_file")]
    pub compose_file: String,

    /// Full start command line (default: `docker-compose -f <compose_file> up -d`)
    pub start_command: Option<String>,

    /// Full stop command line (default: `docker-compose -f <compose_file> down`)
    pub stop_command: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            start_command: None,
            stop_command: None,
        }
    }
}

impl ClusterConfig {
    /// Start command split into program and arguments
    pub fn start_argv(&self) -> anyhow::Result<Vec<String>> {
        match self.start_command {
            Some(ref cmd) => split_command("start_command", cmd),
            None => Ok(self.compose_argv(&["up", "-d"])),
        }
    }

    /// Stop command split into program and arguments
    pub fn stop_argv(&self) -> anyhow::Result<Vec<String>> {
        match self.stop_command {
            Some(ref cmd) => split_command("stop_command", cmd),
            None => Ok(self.compose_argv(&["down"])),
        }
    }

    fn compose_argv(&self, action: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "docker-compose".to_string(),
            "-f".to_string(),
            self.compose_file.clone(),
        ];
        argv.extend(action.iter().map(|s| s.to_string()));
        argv
    }
}

fn split_command(field: &str, cmd: &str) -> anyhow::Result<Vec<String>> {
    let argv = shell_words::split(cmd)
        .map_err(|e| anyhow::anyhow!("'{}' is not a valid command line: {}", field, e))?;
    if argv.is_empty() {
        anyhow::bail!("'{}' must not be empty", field);
    }
    Ok(argv)
}

// Default value functions
fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_write_route() -> RouteConfig {
    RouteConfig {
        listen_port: 8545,
        target_port: 18545,
    }
}

fn default_read_route() -> RouteConfig {
    RouteConfig {
        listen_port: 8547,
        target_port: 18547,
    }
}

fn default_idle_seconds() -> i64 {
    30
}

fn default_startup_timeout_ms() -> u64 {
    120_000
}

fn default_probe_interval_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_idle_check_interval_ms() -> u64 {
    2000
}

fn default_compose_file() -> String {
    "docker-compose.secure.yml".to_string()
}

impl Config {
    /// Load a TOML file, apply `RPC_*` environment overrides and validate.
    ///
    /// A missing file is only an error when `required` is set.
    pub fn load<P: AsRef<Path>>(path: P, required: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Config::default(),
            Err(e) => {
                return Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e));
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup function
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        macro_rules! parse_into {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    match parse_value(&raw) {
                        Ok(value) => $field = value,
                        Err(e) => errors.push(format!("{}: {}", $key, e)),
                    }
                }
            };
        }

        if let Some(host) = lookup("RPC_LISTEN_HOST") {
            self.server.listen_host = host;
        }
        if let Some(secret) = lookup("RPC_SHARED_SECRET") {
            self.server.shared_secret = Some(secret).filter(|s| !s.is_empty());
        }

        parse_into!("RPC_WRITE_PORT", self.routes.write.listen_port);
        parse_into!("RPC_WRITE_TARGET_PORT", self.routes.write.target_port);
        parse_into!("RPC_READ_PORT", self.routes.read.listen_port);
        parse_into!("RPC_READ_TARGET_PORT", self.routes.read.target_port);

        parse_into!("RPC_IDLE_SECONDS", self.lifecycle.idle_seconds);
        parse_into!("RPC_STARTUP_TIMEOUT_MS", self.lifecycle.startup_timeout_ms);
        parse_into!("RPC_PROBE_INTERVAL_MS", self.lifecycle.probe_interval_ms);
        parse_into!("RPC_PROBE_TIMEOUT_MS", self.lifecycle.probe_timeout_ms);
        parse_into!("RPC_IDLE_CHECK_INTERVAL_MS", self.lifecycle.idle_check_interval_ms);
        parse_into!("RPC_STOP_ON_EXIT", self.lifecycle.stop_on_exit);

        if let Some(file) = lookup("RPC_COMPOSE_FILE") {
            self.cluster.compose_file = file;
        }
        if let Some(cmd) = lookup("RPC_START_COMMAND") {
            self.cluster.start_command = Some(cmd);
        }
        if let Some(cmd) = lookup("RPC_STOP_COMMAND") {
            self.cluster.stop_command = Some(cmd);
        }

        if !errors.is_empty() {
            anyhow::bail!("Invalid environment:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, route) in [("write", &self.routes.write), ("read", &self.routes.read)] {
            if route.listen_port == 0 {
                errors.push(format!("Route '{}': 'listen_port' must be greater than 0", name));
            }
            if route.target_port == 0 {
                errors.push(format!("Route '{}': 'target_port' must be greater than 0", name));
            }
        }

        if self.routes.write.listen_port == self.routes.read.listen_port {
            errors.push(format!(
                "Routes 'write' and 'read' share listen port {}",
                self.routes.write.listen_port
            ));
        }

        if self.lifecycle.startup_timeout_ms == 0 {
            errors.push("'startup_timeout_ms' must be greater than 0".to_string());
        }
        if self.lifecycle.probe_interval_ms == 0 {
            errors.push("'probe_interval_ms' must be greater than 0".to_string());
        }
        if self.lifecycle.probe_timeout_ms == 0 {
            errors.push("'probe_timeout_ms' must be greater than 0".to_string());
        }
        if self.lifecycle.idle_check_interval_ms == 0 {
            errors.push("'idle_check_interval_ms' must be greater than 0".to_string());
        }

        if let Err(e) = self.cluster.start_argv() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.cluster.stop_argv() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_value<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("invalid value '{}': {}", raw, e))
}
