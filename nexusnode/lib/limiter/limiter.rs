use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{
    build_constraint, check_breach, create_cgroup, Breach, CgroupHandle, InstanceHandle,
    SandboxConstraint, UsageSampler,
};
use crate::{
    config::HostConfig,
    models::{ServerResource, UsageSample},
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Sizes sandboxes and measures what they use.
///
/// Everything an instance runs shares one cgroup: the sandbox and any shell attached to it.
#[derive(Clone)]
pub struct ResourceLimiter {
    config: Arc<HostConfig>,
    sampler: UsageSampler,
    cgroups: Arc<Mutex<HashMap<String, CgroupHandle>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceLimiter {
    /// Creates a limiter using the host's cgroup and sampling settings.
    pub fn new(config: Arc<HostConfig>) -> Self {
        Self {
            config,
            sampler: UsageSampler::new(),
            cgroups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Maps a declared quota onto enforceable constraints.
    pub fn build_constraint(&self, limits: &ServerResource) -> SandboxConstraint {
        build_constraint(limits)
    }

    /// Creates the instance's cgroup ahead of spawning its sandbox, if cgroups are enabled and
    /// available. A cgroup left over from an earlier run is removed first.
    pub async fn prepare(
        &self,
        instance_id: &str,
        constraint: &SandboxConstraint,
    ) -> Option<CgroupHandle> {
        let stale = self.lock_cgroups().remove(instance_id);
        if let Some(stale) = stale {
            stale.remove().await;
        }

        if !*self.config.get_enable_cgroups() {
            return None;
        }

        let cgroup = create_cgroup(self.config.get_cgroup_root(), instance_id, constraint).await?;
        self.lock_cgroups()
            .insert(instance_id.to_string(), cgroup.clone());
        Some(cgroup)
    }

    /// The cgroup of an instance, if it has one.
    pub fn cgroup_for(&self, instance_id: &str) -> Option<CgroupHandle> {
        self.lock_cgroups().get(instance_id).cloned()
    }

    /// Makes sure a freshly spawned process sits in the instance's cgroup.
    ///
    /// Children join before exec; this catches the case where that failed.
    pub async fn place(&self, instance_id: &str, pid: u32) {
        let Some(cgroup) = self.cgroup_for(instance_id) else {
            return;
        };

        if let Err(e) = cgroup.add(pid).await {
            tracing::warn!(
                instance_id,
                pid,
                error = %e,
                "failed to move process into cgroup, running with rlimits only"
            );
        }
    }

    /// Puts an extra process of a running instance, such as its shell, under the instance's
    /// limits: into its cgroup and into its usage readings.
    pub async fn adopt(&self, instance_id: &str, pid: u32) {
        self.place(instance_id, pid).await;
        self.sampler.adopt(instance_id, pid);
    }

    /// Takes a usage reading bounded by the configured sample timeout.
    pub async fn sample(&self, handle: &InstanceHandle) -> UsageSample {
        self.sampler
            .sample(handle, self.config.sample_timeout())
            .await
    }

    /// Reports whether `usage` breaches `constraint` in a way that requires termination.
    pub fn check(&self, usage: &ServerResource, constraint: &SandboxConstraint) -> Option<Breach> {
        check_breach(usage, constraint)
    }

    /// Kills whatever is left in the instance's cgroup, removes it and forgets the instance.
    pub async fn release(&self, instance_id: &str) {
        let cgroup = self.lock_cgroups().remove(instance_id);
        if let Some(cgroup) = cgroup {
            cgroup.remove().await;
        }
        self.forget(instance_id);
    }

    /// Drops remembered readings and adopted processes of a stopped instance.
    pub fn forget(&self, instance_id: &str) {
        self.sampler.forget(instance_id);
    }

    fn lock_cgroups(&self) -> MutexGuard<'_, HashMap<String, CgroupHandle>> {
        match self.cgroups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cgroup_root: std::path::PathBuf) -> Arc<HostConfig> {
        Arc::new(
            HostConfig::builder()
                .home_dir(cgroup_root.join("home"))
                .enable_cgroups(true)
                .cgroup_root(cgroup_root.join("nexusnode"))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_prepare_adopt_and_release_share_one_cgroup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory")?;
        let limiter = ResourceLimiter::new(config(dir.path().to_path_buf()));
        let constraint = limiter.build_constraint(&ServerResource::new(1.0, 64, 0.0));

        let cgroup = limiter
            .prepare("srv-x", &constraint)
            .await
            .expect("cgroup handle");
        assert_eq!(limiter.cgroup_for("srv-x"), Some(cgroup.clone()));

        limiter.adopt("srv-x", 4242).await;
        assert_eq!(
            std::fs::read_to_string(cgroup.path().join("cgroup.procs"))?,
            "4242"
        );

        std::fs::remove_file(cgroup.path().join("cgroup.procs"))?;
        std::fs::remove_file(cgroup.path().join("memory.max"))?;
        std::fs::remove_file(cgroup.path().join("cpu.max"))?;
        limiter.release("srv-x").await;

        assert_eq!(limiter.cgroup_for("srv-x"), None);
        assert!(!cgroup.path().exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_is_skipped_when_cgroups_are_disabled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory")?;
        let config = Arc::new(
            HostConfig::builder()
                .home_dir(dir.path().join("home"))
                .enable_cgroups(false)
                .cgroup_root(dir.path().join("nexusnode"))
                .build(),
        );
        let limiter = ResourceLimiter::new(config);
        let constraint = limiter.build_constraint(&ServerResource::new(1.0, 64, 0.0));

        assert_eq!(limiter.prepare("srv-x", &constraint).await, None);
        assert!(!dir.path().join("nexusnode").exists());

        Ok(())
    }
}
