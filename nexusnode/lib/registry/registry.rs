use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::Utc;
use nexusutils::{canonicalize_path, WORKSPACE_ROOT};
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::{
    delete_instance, init_db, insert_instance, load_instances, load_port_allocations,
    reconcile_statuses, update_instance, OperationLocks, PortPool, REGISTRY_DB_MIGRATOR,
};
use crate::{
    config::HostConfig,
    models::{Instance, InstanceStatus, NetworkBinding, ServerResource},
    workspace::WorkspaceStore,
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The in-memory and persisted catalog of instances.
pub struct Registry {
    config: Arc<HostConfig>,
    pool: Pool<Sqlite>,
    instances: RwLock<HashMap<String, Instance>>,
    ports: PortPool,
    workspaces: WorkspaceStore,
    locks: OperationLocks,
}

/// The caller-supplied part of a new instance.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct NewInstance {
    /// Display name.
    #[builder(setter(into))]
    pub name: String,

    /// Command run by the sandbox shell.
    #[builder(setter(into))]
    pub startup_command: String,

    /// Workspace file the startup command executes.
    #[builder(setter(into))]
    pub entrypoint: String,

    /// Declared quota. Zero means unlimited.
    #[serde(default)]
    #[builder(default)]
    pub limits: ServerResource,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Opens the registry database under the configured home directory.
    ///
    /// Instances left starting or running by a previous daemon are moved back to stopped.
    pub async fn open(config: Arc<HostConfig>) -> NexusResult<Self> {
        let pool = init_db(config.registry_db_path(), &REGISTRY_DB_MIGRATOR).await?;

        let reconciled = reconcile_statuses(&pool).await?;
        if reconciled > 0 {
            tracing::warn!(
                count = reconciled,
                "reset instances left running by a previous daemon to stopped"
            );
        }

        let instances = load_instances(&pool)
            .await?
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect::<HashMap<_, _>>();
        let ports = PortPool::new(*config.get_port_range(), load_port_allocations(&pool).await?);
        let workspaces = WorkspaceStore::open(config.workspaces_dir()).await?;
        for instance in instances.values() {
            workspaces.set_quota(&instance.id, instance.limits.disk_bytes());
        }

        tracing::info!(
            instances = instances.len(),
            free_ports = ports.available(),
            "opened registry"
        );

        Ok(Self {
            config,
            pool,
            instances: RwLock::new(instances),
            ports,
            workspaces,
            locks: OperationLocks::default(),
        })
    }

    /// Creates a stopped instance with a seeded workspace and a port from the pool.
    pub async fn create(&self, owner: &str, new: NewInstance) -> NexusResult<Instance> {
        new.limits.validate()?;
        let entrypoint = canonical_entrypoint(&new.entrypoint)?;

        let port = self.ports.reserve().ok_or_else(|| {
            let range = self.config.get_port_range();
            NexusError::ResourceExhausted(format!(
                "no free port in {}..={}",
                range.start, range.end
            ))
        })?;

        let id = format!("srv-{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let instance = Instance {
            id: id.clone(),
            owner: owner.to_string(),
            name: new.name,
            status: InstanceStatus::Stopped,
            limits: new.limits,
            usage: ServerResource::default(),
            startup_command: new.startup_command,
            entrypoint,
            network: NetworkBinding {
                port,
                url: self.config.instance_url(port),
            },
            workspace_ref: id.clone(),
            created_at: now,
            modified_at: now,
        };

        if let Err(e) = self.persist_new(&instance).await {
            self.ports.release(port);
            let _ = self.workspaces.destroy(&id).await;
            return Err(e);
        }

        self.workspaces.set_quota(&id, instance.limits.disk_bytes());
        self.write_cache().insert(id.clone(), instance.clone());
        tracing::info!(instance_id = %id, owner, port, "created instance");

        Ok(instance)
    }

    /// Gets an instance by id.
    pub fn get(&self, instance_id: &str) -> NexusResult<Instance> {
        self.read_cache()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| NexusError::InstanceNotFound(instance_id.to_string()))
    }

    /// Lists the instances visible to a caller, oldest first. Admins see every instance.
    pub fn list_for(&self, owner: &str, is_admin: bool) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .read_cache()
            .values()
            .filter(|instance| is_admin || instance.owner == owner)
            .cloned()
            .collect();

        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        instances
    }

    /// Deletes a stopped or suspended instance together with its workspace, console log and
    /// port allocation.
    pub async fn delete(&self, instance_id: &str) -> NexusResult<Instance> {
        let _guard = self.locks.try_acquire(instance_id)?;
        let mut instance = self.get(instance_id)?;

        if !matches!(
            instance.status,
            InstanceStatus::Stopped | InstanceStatus::Suspended
        ) {
            return Err(NexusError::invalid_state("delete", instance.status));
        }

        let mut tx = self.pool.begin().await?;
        delete_instance(&mut tx, instance_id).await?;
        tx.commit().await?;

        self.write_cache().remove(instance_id);
        self.ports.release(instance.network.port);
        self.workspaces.destroy(instance_id).await?;

        let log_path = self.config.console_log_path(instance_id);
        let _ = tokio::fs::remove_file(&log_path).await;
        let _ = tokio::fs::remove_file(log_path.with_extension("old")).await;

        self.locks.forget(instance_id);
        tracing::info!(instance_id, "deleted instance");

        instance.status = InstanceStatus::Deleted;
        instance.usage = ServerResource::default();
        Ok(instance)
    }

    /// Replaces the declared quota. Only allowed while stopped.
    ///
    /// The new disk quota applies to workspace writes right away.
    pub async fn update_limits(
        &self,
        instance_id: &str,
        limits: ServerResource,
    ) -> NexusResult<Instance> {
        limits.validate()?;
        let _guard = self.locks.try_acquire(instance_id)?;

        let instance = self
            .update_stopped(instance_id, "update limits of", |instance| {
                instance.limits = limits;
                Ok(())
            })
            .await?;
        self.workspaces
            .set_quota(instance_id, instance.limits.disk_bytes());

        Ok(instance)
    }

    /// Replaces the startup command and/or entrypoint. Only allowed while stopped.
    pub async fn update_startup(
        &self,
        instance_id: &str,
        startup_command: Option<String>,
        entrypoint: Option<String>,
    ) -> NexusResult<Instance> {
        let entrypoint = entrypoint.as_deref().map(canonical_entrypoint).transpose()?;
        let _guard = self.locks.try_acquire(instance_id)?;

        self.update_stopped(instance_id, "update startup of", |instance| {
            if let Some(command) = startup_command {
                instance.startup_command = command;
            }
            if let Some(entrypoint) = entrypoint {
                instance.entrypoint = entrypoint;
            }
            Ok(())
        })
        .await
    }

    /// The workspace store owned by the registry.
    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    /// The host configuration.
    pub fn config(&self) -> &Arc<HostConfig> {
        &self.config
    }

    /// The per-instance operation locks shared with the supervisor.
    pub fn locks(&self) -> &OperationLocks {
        &self.locks
    }

    /// Moves an instance through the lifecycle state machine and persists the new status.
    ///
    /// Callers must hold the instance's operation lock.
    pub(crate) async fn transition(
        &self,
        instance_id: &str,
        next: InstanceStatus,
    ) -> NexusResult<Instance> {
        let mut instance = self.get(instance_id)?;
        if !instance.status.can_transition_to(next) {
            return Err(NexusError::invalid_state(
                format!("move to {}", next),
                instance.status,
            ));
        }

        tracing::debug!(instance_id, from = %instance.status, to = %next, "transition");
        instance.status = next;
        instance.modified_at = Utc::now();
        if !next.has_sandbox() {
            instance.usage = ServerResource::default();
        }

        update_instance(&self.pool, &instance).await?;
        self.write_cache()
            .insert(instance_id.to_string(), instance.clone());

        Ok(instance)
    }

    /// Stores a usage sample. Ignored unless the instance is running.
    pub(crate) fn record_usage(&self, instance_id: &str, usage: ServerResource) {
        if let Some(instance) = self.write_cache().get_mut(instance_id) {
            if instance.status == InstanceStatus::Running {
                instance.usage = usage;
            }
        }
    }
}

impl Registry {
    async fn persist_new(&self, instance: &Instance) -> NexusResult<()> {
        self.workspaces.seed(&instance.id).await?;

        let mut tx = self.pool.begin().await?;
        insert_instance(&mut tx, instance).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn update_stopped(
        &self,
        instance_id: &str,
        action: &str,
        apply: impl FnOnce(&mut Instance) -> NexusResult<()>,
    ) -> NexusResult<Instance> {
        let mut instance = self.get(instance_id)?;
        if instance.status != InstanceStatus::Stopped {
            return Err(NexusError::invalid_state(action, instance.status));
        }

        apply(&mut instance)?;
        instance.modified_at = Utc::now();

        update_instance(&self.pool, &instance).await?;
        self.write_cache()
            .insert(instance_id.to_string(), instance.clone());

        tracing::info!(instance_id, action, "updated instance");
        Ok(instance)
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<String, Instance>> {
        match self.instances.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<String, Instance>> {
        match self.instances.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Canonicalizes an entrypoint, which must name something below the workspace root.
pub fn canonical_entrypoint(entrypoint: &str) -> NexusResult<String> {
    let path = canonicalize_path(entrypoint).map_err(|e| NexusError::InvalidPath(e.to_string()))?;
    if path == WORKSPACE_ROOT {
        return Err(NexusError::InvalidPath(
            "entrypoint must name a file".to_string(),
        ));
    }

    Ok(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::PortRange;

    async fn open_registry(home: &TempDir, ports: PortRange) -> anyhow::Result<Registry> {
        let config = HostConfig::builder()
            .home_dir(home.path())
            .port_range(ports)
            .build();
        Ok(Registry::open(Arc::new(config)).await?)
    }

    fn bot(name: &str) -> NewInstance {
        NewInstance::builder()
            .name(name)
            .startup_command("node index.js")
            .entrypoint("index.js")
            .limits(ServerResource::new(1.0, 512, 5.0))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_create_assigns_port_and_seeds_workspace() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;

        let instance = registry.create("alice", bot("discord-bot")).await?;
        assert!(instance.get_id().starts_with("srv-"));
        assert_eq!(instance.get_status(), &InstanceStatus::Stopped);
        assert_eq!(instance.get_entrypoint(), "/index.js");
        assert_eq!(instance.get_network().port, 21000);
        assert_eq!(instance.get_network().url, "http://127.0.0.1:21000");
        assert!(registry
            .workspaces()
            .exists(instance.get_id(), "/README.md")
            .await?);

        assert_eq!(registry.get(instance.get_id())?, instance);
        assert!(matches!(
            registry.get("srv-missing"),
            Err(NexusError::InstanceNotFound(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_list_for_scopes_by_owner() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;

        registry.create("alice", bot("a1")).await?;
        registry.create("bob", bot("b1")).await?;
        registry.create("alice", bot("a2")).await?;

        let names = |list: Vec<Instance>| -> Vec<String> {
            list.into_iter().map(|i| i.name).collect()
        };
        assert_eq!(names(registry.list_for("alice", false)), vec!["a1", "a2"]);
        assert_eq!(names(registry.list_for("bob", false)), vec!["b1"]);
        assert_eq!(registry.list_for("carol", true).len(), 3);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_create_fails_when_port_pool_is_empty() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21000)).await?;

        let first = registry.create("alice", bot("one")).await?;
        assert!(matches!(
            registry.create("alice", bot("two")).await,
            Err(NexusError::ResourceExhausted(_))
        ));

        registry.delete(first.get_id()).await?;
        let again = registry.create("alice", bot("three")).await?;
        assert_eq!(again.get_network().port, 21000);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_delete_requires_stopped_and_cascades() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;
        let instance = registry.create("alice", bot("bot")).await?;
        let id = instance.get_id().clone();

        registry.transition(&id, InstanceStatus::Starting).await?;
        assert!(matches!(
            registry.delete(&id).await,
            Err(NexusError::InvalidState { status: InstanceStatus::Starting, .. })
        ));

        registry.transition(&id, InstanceStatus::Stopped).await?;
        let deleted = registry.delete(&id).await?;
        assert_eq!(deleted.get_status(), &InstanceStatus::Deleted);
        assert!(registry.get(&id).is_err());
        assert!(!registry.workspaces().dir(&id).exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_updates_only_while_stopped() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;
        let id = registry.create("alice", bot("bot")).await?.id;

        let updated = registry
            .update_limits(&id, ServerResource::new(2.0, 1024, 10.0))
            .await?;
        assert_eq!(updated.get_limits().ram_mb, 1024);

        let updated = registry
            .update_startup(&id, Some("python main.py".into()), Some("main.py".into()))
            .await?;
        assert_eq!(updated.get_entrypoint(), "/main.py");

        registry.transition(&id, InstanceStatus::Suspended).await?;
        assert!(matches!(
            registry.update_limits(&id, ServerResource::default()).await,
            Err(NexusError::InvalidState { .. })
        ));
        assert!(matches!(
            registry.update_startup(&id, None, Some("/".into())).await,
            Err(NexusError::InvalidPath(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_oversized_limits_are_rejected_and_leave_instance_stopped() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;
        let id = registry.create("alice", bot("bot")).await?.id;

        assert!(matches!(
            registry
                .update_limits(&id, ServerResource::new(1.0, 1 << 50, 1.0))
                .await,
            Err(NexusError::InvalidArgument(_))
        ));

        let instance = registry.get(&id)?;
        assert_eq!(instance.get_status(), &InstanceStatus::Stopped);
        assert_eq!(instance.get_limits().ram_mb, 512);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_disk_limit_caps_workspace_writes() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;
        let id = registry.create("alice", bot("bot")).await?.id;

        // 1 MiB, expressed in GiB.
        registry
            .update_limits(&id, ServerResource::new(1.0, 512, 1.0 / 1024.0))
            .await?;
        assert!(matches!(
            registry
                .workspaces()
                .write(&id, "/big.bin", vec![0u8; 2 * 1024 * 1024])
                .await,
            Err(NexusError::ResourceExhausted(_))
        ));
        registry
            .workspaces()
            .write(&id, "/small.bin", vec![0u8; 1024])
            .await?;

        registry
            .update_limits(&id, ServerResource::new(1.0, 512, 0.0))
            .await?;
        registry
            .workspaces()
            .write(&id, "/big.bin", vec![0u8; 2 * 1024 * 1024])
            .await?;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_transition_rejects_edges_outside_the_table() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let registry = open_registry(&home, PortRange::new(21000, 21010)).await?;
        let id = registry.create("alice", bot("bot")).await?.id;

        assert!(matches!(
            registry.transition(&id, InstanceStatus::Running).await,
            Err(NexusError::InvalidState { status: InstanceStatus::Stopped, .. })
        ));

        registry.transition(&id, InstanceStatus::Suspended).await?;
        assert!(registry
            .transition(&id, InstanceStatus::Starting)
            .await
            .is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_reopen_keeps_ports_and_reconciles_running() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let ports = PortRange::new(21000, 21010);

        let (running_id, suspended_id) = {
            let registry = open_registry(&home, ports).await?;
            let running = registry.create("alice", bot("running")).await?.id;
            let suspended = registry.create("alice", bot("suspended")).await?.id;

            registry.transition(&running, InstanceStatus::Starting).await?;
            registry.transition(&running, InstanceStatus::Running).await?;
            registry.record_usage(&running, ServerResource::new(0.5, 100, 0.1));
            registry.transition(&suspended, InstanceStatus::Suspended).await?;
            (running, suspended)
        };

        let registry = open_registry(&home, ports).await?;
        let running = registry.get(&running_id)?;
        assert_eq!(running.get_status(), &InstanceStatus::Stopped);
        assert_eq!(running.get_usage(), &ServerResource::default());
        assert_eq!(running.get_network().port, 21000);
        assert_eq!(
            registry.get(&suspended_id)?.get_status(),
            &InstanceStatus::Suspended
        );

        let third = registry.create("bob", bot("third")).await?;
        assert_eq!(third.get_network().port, 21002);

        Ok(())
    }
}
