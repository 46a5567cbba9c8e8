use std::{path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The environment variable that overrides the home directory.
pub const NEXUSNODE_HOME_ENV_VAR: &str = "NEXUSNODE_HOME";

/// The sub directory of the user's home where nexusnode keeps its state by default.
pub const NEXUSNODE_HOME_DIR: &str = ".nexusnode";

/// The name of the host configuration file inside the home directory.
pub const CONFIG_FILENAME: &str = "nexusnode.toml";

/// The name of the registry database inside the home directory.
pub const REGISTRY_DB_FILENAME: &str = "registry.db";

/// The sub directory holding one directory per instance workspace.
pub const WORKSPACES_SUBDIR: &str = "workspaces";

/// The sub directory holding console and daemon logs.
pub const LOG_SUBDIR: &str = "log";

/// The prefix of the daemon's own log file.
pub const DAEMON_LOG_PREFIX: &str = "nexusnode";

/// Default address for the HTTP server.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3456";

/// Default host used when building instance URLs.
pub const DEFAULT_PUBLIC_HOST: &str = "127.0.0.1";

/// First port handed out to instances.
pub const DEFAULT_PORT_RANGE_START: u16 = 20000;

/// Last port handed out to instances.
pub const DEFAULT_PORT_RANGE_END: u16 = 20999;

/// Shell used for sandboxes and interactive sessions.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Time a sandbox gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE_MS: u64 = 5000;

/// Time after which a silent sandbox is considered ready.
pub const DEFAULT_READY_GRACE_MS: u64 = 2000;

/// Interval between usage samples of a running instance.
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2000;

/// Upper bound on a single usage sample.
pub const DEFAULT_SAMPLE_TIMEOUT_MS: u64 = 500;

/// Interval between entrypoint existence checks of a running instance.
pub const DEFAULT_ENTRYPOINT_CHECK_MS: u64 = 1000;

/// Number of events a session can fall behind before it starts losing them.
pub const DEFAULT_SESSION_BUFFER: usize = 500;

/// Size at which an instance console log is rotated.
pub const DEFAULT_CONSOLE_LOG_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// Parent cgroup under which instance cgroups are created.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/nexusnode";

/// The path where all nexusnode state is stored when nothing else is configured.
pub static DEFAULT_NEXUSNODE_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(NEXUSNODE_HOME_DIR)
});
