use std::{path::Path, sync::Arc};

use getset::Getters;

use crate::{
    config::HostConfig,
    limiter::ResourceLimiter,
    models::{Caller, Instance},
    registry::{init_db, Registry, REGISTRY_DB_MIGRATOR},
    session::SessionMultiplexer,
    supervisor::InstanceSupervisor,
    workspace::WorkspaceStore,
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a node runs, wired together.
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NodeHost {
    /// Host configuration.
    config: Arc<HostConfig>,

    /// Instance catalog.
    registry: Arc<Registry>,

    /// Quota translation and usage sampling.
    limiter: ResourceLimiter,

    /// Log tails and shells.
    multiplexer: SessionMultiplexer,

    /// Lifecycle transitions.
    supervisor: InstanceSupervisor,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeHost {
    /// Lays out a home directory: default configuration file, workspace and log directories
    /// and a migrated registry database. Existing files are left alone.
    pub async fn init(home_dir: impl AsRef<Path>) -> NexusResult<HostConfig> {
        let config = HostConfig::load(home_dir).await?;
        if config.write_default_if_missing().await? {
            tracing::info!(home_dir = %config.get_home_dir().display(), "wrote default config");
        }

        tokio::fs::create_dir_all(config.workspaces_dir()).await?;
        tokio::fs::create_dir_all(config.log_dir()).await?;

        let pool = init_db(config.registry_db_path(), &REGISTRY_DB_MIGRATOR).await?;
        pool.close().await;

        Ok(config)
    }

    /// Opens the registry under the configured home directory and wires up the other
    /// components.
    pub async fn open(config: HostConfig) -> NexusResult<Self> {
        let config = Arc::new(config);
        tokio::fs::create_dir_all(config.log_dir()).await?;

        let registry = Arc::new(Registry::open(Arc::clone(&config)).await?);
        let limiter = ResourceLimiter::new(Arc::clone(&config));
        let multiplexer = SessionMultiplexer::new(Arc::clone(&registry), limiter.clone());
        let supervisor =
            InstanceSupervisor::new(Arc::clone(&registry), limiter.clone(), multiplexer.clone());

        Ok(Self {
            config,
            registry,
            limiter,
            multiplexer,
            supervisor,
        })
    }

    /// The workspace store.
    pub fn workspaces(&self) -> &WorkspaceStore {
        self.registry.workspaces()
    }

    /// Gets an instance the caller may see.
    ///
    /// Instances owned by someone else are reported as not found.
    pub fn instance_for(&self, caller: &Caller, instance_id: &str) -> NexusResult<Instance> {
        let instance = self.registry.get(instance_id)?;
        if !caller.can_access(&instance) {
            return Err(NexusError::InstanceNotFound(instance_id.to_string()));
        }

        Ok(instance)
    }

    /// Stops every sandbox. Called once when the daemon exits.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
        tracing::info!("node host shut down");
    }
}
