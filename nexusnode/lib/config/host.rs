use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use super::{
    CONFIG_FILENAME, DEFAULT_CGROUP_ROOT, DEFAULT_CONSOLE_LOG_MAX_SIZE,
    DEFAULT_ENTRYPOINT_CHECK_MS, DEFAULT_LISTEN_ADDR, DEFAULT_NEXUSNODE_HOME,
    DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START, DEFAULT_PUBLIC_HOST,
    DEFAULT_READY_GRACE_MS, DEFAULT_SAMPLE_INTERVAL_MS, DEFAULT_SAMPLE_TIMEOUT_MS,
    DEFAULT_SESSION_BUFFER, DEFAULT_SHELL, DEFAULT_STOP_GRACE_MS, LOG_SUBDIR,
    NEXUSNODE_HOME_ENV_VAR, REGISTRY_DB_FILENAME, WORKSPACES_SUBDIR,
};
use crate::{NexusError, NexusResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of a nexusnode host.
///
/// Loaded from `nexusnode.toml` in the home directory. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct HostConfig {
    /// Where the registry, workspaces and logs live. Never read from the file itself.
    #[serde(skip)]
    #[builder(default = DEFAULT_NEXUSNODE_HOME.clone(), setter(into))]
    home_dir: PathBuf,

    /// Address the HTTP API listens on.
    #[builder(default = default_listen_addr())]
    listen_addr: SocketAddr,

    /// Host name used to build instance URLs.
    #[builder(default = DEFAULT_PUBLIC_HOST.to_string(), setter(into))]
    public_host: String,

    /// Ports handed out to instances.
    #[builder(default)]
    port_range: PortRange,

    /// Shell used to run startup commands and interactive sessions.
    #[builder(default = DEFAULT_SHELL.to_string(), setter(into))]
    shell: String,

    /// Milliseconds a sandbox gets to exit after SIGTERM.
    #[builder(default = DEFAULT_STOP_GRACE_MS)]
    stop_grace_ms: u64,

    /// Milliseconds after which a silent sandbox is considered ready.
    #[builder(default = DEFAULT_READY_GRACE_MS)]
    ready_grace_ms: u64,

    /// Milliseconds between usage samples.
    #[builder(default = DEFAULT_SAMPLE_INTERVAL_MS)]
    sample_interval_ms: u64,

    /// Upper bound in milliseconds on a single usage sample.
    #[builder(default = DEFAULT_SAMPLE_TIMEOUT_MS)]
    sample_timeout_ms: u64,

    /// Milliseconds between entrypoint existence checks.
    #[builder(default = DEFAULT_ENTRYPOINT_CHECK_MS)]
    entrypoint_check_ms: u64,

    /// Events a session may fall behind before older ones are dropped for it.
    #[builder(default = DEFAULT_SESSION_BUFFER)]
    session_buffer: usize,

    /// Size at which an instance console log is rotated.
    #[builder(default = DEFAULT_CONSOLE_LOG_MAX_SIZE)]
    console_log_max_size: u64,

    /// Whether to place sandboxes into cgroups.
    #[builder(default = true)]
    enable_cgroups: bool,

    /// Parent cgroup for instance cgroups.
    #[builder(default = PathBuf::from(DEFAULT_CGROUP_ROOT), setter(into))]
    cgroup_root: PathBuf,
}

/// An inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,

    /// Last port, inclusive.
    pub end: u16,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostConfig {
    /// Resolves the home directory: an explicit path wins, then `NEXUSNODE_HOME`, then
    /// `~/.nexusnode`.
    pub fn resolve_home(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }

        match env::var(NEXUSNODE_HOME_ENV_VAR) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => DEFAULT_NEXUSNODE_HOME.clone(),
        }
    }

    /// Loads the configuration from `home_dir`, falling back to defaults when there is no
    /// configuration file.
    pub async fn load(home_dir: impl AsRef<Path>) -> NexusResult<Self> {
        let home_dir = home_dir.as_ref();
        let path = home_dir.join(CONFIG_FILENAME);

        let mut config = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            toml::from_str::<HostConfig>(&content)?
        } else {
            HostConfig::default()
        };

        config.home_dir = home_dir.to_path_buf();
        config.validate()?;

        tracing::debug!(home_dir = %home_dir.display(), "loaded host config");
        Ok(config)
    }

    /// Writes the configuration to the home directory if no configuration file exists yet.
    pub async fn write_default_if_missing(&self) -> NexusResult<bool> {
        let path = self.home_dir.join(CONFIG_FILENAME);
        if fs::try_exists(&path).await? {
            return Ok(false);
        }

        fs::create_dir_all(&self.home_dir).await?;
        fs::write(&path, toml::to_string_pretty(self)?).await?;
        Ok(true)
    }

    /// Checks the configuration for values the host cannot work with.
    pub fn validate(&self) -> NexusResult<()> {
        if self.port_range.start > self.port_range.end {
            return Err(NexusError::custom(anyhow::anyhow!(
                "invalid port range: {}..={}",
                self.port_range.start,
                self.port_range.end
            )));
        }

        if self.session_buffer == 0 {
            return Err(NexusError::custom(anyhow::anyhow!(
                "session_buffer must be at least 1"
            )));
        }

        Ok(())
    }

    /// The SQLite database holding the registry.
    pub fn registry_db_path(&self) -> PathBuf {
        self.home_dir.join(REGISTRY_DB_FILENAME)
    }

    /// The directory holding every instance workspace.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.home_dir.join(WORKSPACES_SUBDIR)
    }

    /// The directory holding console and daemon logs.
    pub fn log_dir(&self) -> PathBuf {
        self.home_dir.join(LOG_SUBDIR)
    }

    /// The rotating console log of an instance.
    pub fn console_log_path(&self, instance_id: &str) -> PathBuf {
        self.log_dir()
            .join(format!("{}.{}", instance_id, nexusutils::LOG_SUFFIX))
    }

    /// The URL an instance on `port` is reachable at.
    pub fn instance_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.public_host, port)
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Time after which a silent sandbox is considered ready.
    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.ready_grace_ms)
    }

    /// Interval between usage samples.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Upper bound on a single usage sample.
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// Interval between entrypoint existence checks.
    pub fn entrypoint_check_interval(&self) -> Duration {
        Duration::from_millis(self.entrypoint_check_ms)
    }
}

impl PortRange {
    /// Creates an inclusive port range.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Iterates over every port in the range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for HostConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_listen_addr() -> SocketAddr {
    DEFAULT_LISTEN_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 3456)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
