use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nexusutils::{canonicalize_path, file_name, is_within, parent_path, WORKSPACE_ROOT};
use tokio::{
    fs,
    sync::{broadcast, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock},
};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    models::{NodeKind, WorkspaceChange, WorkspaceNode},
    NexusError, NexusResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Directory under the store root where deleted nodes are parked before removal.
const TRASH_DIR: &str = ".trash";

/// Capacity of the change feed.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Contents of the README placed in new workspaces.
const SEED_README: &str = "# Workspace\n\nUpload your bot files here. The entrypoint configured for the instance must exist before it can be started.\n";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The persistent file trees of every instance.
///
/// Each workspace is a real directory under the store root, named after its instance. That
/// directory is also the sandbox's working directory, so anything the running process writes is
/// visible here on the next read.
#[derive(Clone)]
pub struct WorkspaceStore {
    inner: Arc<WorkspaceStoreInner>,
}

struct WorkspaceStoreInner {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    quotas: Mutex<HashMap<String, u64>>,
    changes: broadcast::Sender<WorkspaceChange>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WorkspaceStore {
    /// Opens the store rooted at `root`, creating it if necessary.
    ///
    /// Leftovers from interrupted deletes are cleaned up.
    pub async fn open(root: impl Into<PathBuf>) -> NexusResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let trash = root.join(TRASH_DIR);
        if fs::try_exists(&trash).await? {
            fs::remove_dir_all(&trash).await?;
        }
        fs::create_dir_all(&trash).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            inner: Arc::new(WorkspaceStoreInner {
                root,
                locks: Mutex::new(HashMap::new()),
                quotas: Mutex::new(HashMap::new()),
                changes,
            }),
        })
    }

    /// The host directory backing an instance's workspace.
    pub fn dir(&self, instance_id: &str) -> PathBuf {
        self.inner.root.join(instance_id)
    }

    /// Caps the total size of the files in a workspace. `None` lifts the cap.
    ///
    /// Writes that would push the workspace past its cap fail with
    /// [`NexusError::ResourceExhausted`].
    pub fn set_quota(&self, instance_id: &str, bytes: Option<u64>) {
        let mut quotas = match self.inner.quotas.lock() {
            Ok(quotas) => quotas,
            Err(poisoned) => poisoned.into_inner(),
        };

        match bytes {
            Some(bytes) => quotas.insert(instance_id.to_string(), bytes),
            None => quotas.remove(instance_id),
        };
    }

    /// Subscribes to removals and renames across all workspaces.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceChange> {
        self.inner.changes.subscribe()
    }

    /// Creates an instance's workspace with the default file set: an empty `/src` directory
    /// and a `/README.md`.
    pub async fn seed(&self, instance_id: &str) -> NexusResult<()> {
        validate_instance_id(instance_id)?;
        let _guard = self.write_lock(instance_id).await;

        let dir = self.dir(instance_id);
        fs::create_dir_all(dir.join("src")).await?;
        fs::write(dir.join("README.md"), SEED_README).await?;

        tracing::debug!(instance_id, dir = %dir.display(), "seeded workspace");
        Ok(())
    }

    /// Removes an instance's workspace and everything in it.
    pub async fn destroy(&self, instance_id: &str) -> NexusResult<()> {
        validate_instance_id(instance_id)?;
        {
            let _guard = self.write_lock(instance_id).await;
            let dir = self.dir(instance_id);
            if fs::try_exists(&dir).await? {
                self.remove_via_trash(&dir).await?;
            }
        }

        self.forget_lock(instance_id);
        self.set_quota(instance_id, None);
        let _ = self.inner.changes.send(WorkspaceChange::Removed {
            instance_id: instance_id.to_string(),
            path: WORKSPACE_ROOT.to_string(),
        });

        tracing::debug!(instance_id, "destroyed workspace");
        Ok(())
    }

    /// Lists the direct children of a directory, directories first, then by name.
    pub async fn list(&self, instance_id: &str, dir: &str) -> NexusResult<Vec<WorkspaceNode>> {
        let _guard = self.read_lock(instance_id).await;
        let (dir, host_dir) = self.resolve(instance_id, dir).await?;

        let metadata = metadata_or_not_found(&host_dir, &dir).await?;
        if !metadata.is_dir() {
            return Err(NexusError::InvalidPath(format!("not a directory: {}", dir)));
        }

        let mut nodes = Vec::new();
        let mut entries = fs::read_dir(&host_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let path = nexusutils::join_path(&dir, &name);
            nodes.push(node_from_metadata(path, &metadata));
        }

        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    /// Returns the metadata of one node.
    pub async fn stat(&self, instance_id: &str, path: &str) -> NexusResult<WorkspaceNode> {
        let _guard = self.read_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        let metadata = metadata_or_not_found(&host_path, &path).await?;
        Ok(node_from_metadata(path, &metadata))
    }

    /// Whether a node exists at `path`.
    pub async fn exists(&self, instance_id: &str, path: &str) -> NexusResult<bool> {
        let _guard = self.read_lock(instance_id).await;
        let (_, host_path) = self.resolve(instance_id, path).await?;
        Ok(fs::try_exists(&host_path).await?)
    }

    /// Reads the content of a file.
    pub async fn read(&self, instance_id: &str, path: &str) -> NexusResult<Bytes> {
        let _guard = self.read_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        let metadata = metadata_or_not_found(&host_path, &path).await?;
        if metadata.is_dir() {
            return Err(NexusError::InvalidPath(format!("is a directory: {}", path)));
        }

        Ok(Bytes::from(fs::read(&host_path).await?))
    }

    /// Creates or overwrites a file. The parent directory must already exist.
    ///
    /// Readers see either the old or the new content, never a partial write. Fails with
    /// [`NexusError::ResourceExhausted`] if the workspace would outgrow its quota.
    pub async fn write(
        &self,
        instance_id: &str,
        path: &str,
        content: impl AsRef<[u8]>,
    ) -> NexusResult<WorkspaceNode> {
        let _guard = self.write_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        if path == WORKSPACE_ROOT {
            return Err(NexusError::InvalidPath("cannot write to the root".to_string()));
        }
        self.ensure_parent_dir(instance_id, &path).await?;

        let replaced_size = match fs::symlink_metadata(&host_path).await {
            Ok(metadata) if metadata.is_dir() => {
                return Err(NexusError::InvalidPath(format!("is a directory: {}", path)));
            }
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        };
        let content = content.as_ref();
        self.ensure_quota(instance_id, &path, replaced_size, content.len() as u64)
            .await?;

        let tmp_path = host_path.with_file_name(format!(
            ".{}.{}.tmp",
            file_name(&path),
            Uuid::new_v4().simple()
        ));
        fs::write(&tmp_path, content).await?;
        if let Err(e) = fs::rename(&tmp_path, &host_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        let metadata = fs::metadata(&host_path).await?;
        tracing::debug!(instance_id, path, size = metadata.len(), "wrote file");
        Ok(node_from_metadata(path, &metadata))
    }

    /// Creates an empty file. Fails if anything already exists at `path`.
    pub async fn create_file(&self, instance_id: &str, path: &str) -> NexusResult<WorkspaceNode> {
        let _guard = self.write_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        self.ensure_parent_dir(instance_id, &path).await?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&host_path)
            .await
            .map_err(|e| already_exists_or(e, &path))?;

        let metadata = file.metadata().await?;
        Ok(node_from_metadata(path, &metadata))
    }

    /// Creates an empty directory. Fails if anything already exists at `path`.
    pub async fn create_dir(&self, instance_id: &str, path: &str) -> NexusResult<WorkspaceNode> {
        let _guard = self.write_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        if path == WORKSPACE_ROOT {
            return Err(NexusError::AlreadyExists(path));
        }
        self.ensure_parent_dir(instance_id, &path).await?;
        fs::create_dir(&host_path)
            .await
            .map_err(|e| already_exists_or(e, &path))?;

        let metadata = fs::metadata(&host_path).await?;
        Ok(node_from_metadata(path, &metadata))
    }

    /// Deletes a node. Deleting a directory deletes everything below it.
    ///
    /// The node disappears in one step: it is first moved out of the tree, then removed.
    pub async fn delete(&self, instance_id: &str, path: &str) -> NexusResult<()> {
        let _guard = self.write_lock(instance_id).await;
        let (path, host_path) = self.resolve(instance_id, path).await?;

        if path == WORKSPACE_ROOT {
            return Err(NexusError::InvalidPath(
                "cannot delete the workspace root".to_string(),
            ));
        }

        metadata_or_not_found(&host_path, &path).await?;
        self.remove_via_trash(&host_path).await?;

        tracing::debug!(instance_id, path, "deleted workspace node");
        let _ = self.inner.changes.send(WorkspaceChange::Removed {
            instance_id: instance_id.to_string(),
            path,
        });

        Ok(())
    }

    /// Moves a node to a new path. Descendants of a directory move with it.
    pub async fn rename(
        &self,
        instance_id: &str,
        from: &str,
        to: &str,
    ) -> NexusResult<WorkspaceNode> {
        let _guard = self.write_lock(instance_id).await;
        let (from, host_from) = self.resolve(instance_id, from).await?;
        let (to, host_to) = self.resolve(instance_id, to).await?;

        if from == WORKSPACE_ROOT || to == WORKSPACE_ROOT {
            return Err(NexusError::InvalidPath(
                "cannot rename the workspace root".to_string(),
            ));
        }

        metadata_or_not_found(&host_from, &from).await?;
        if from == to {
            let metadata = fs::metadata(&host_from).await?;
            return Ok(node_from_metadata(to, &metadata));
        }

        if is_within(&to, &from) {
            return Err(NexusError::InvalidPath(format!(
                "cannot move {} into itself",
                from
            )));
        }

        if fs::symlink_metadata(&host_to).await.is_ok() {
            return Err(NexusError::AlreadyExists(to));
        }
        self.ensure_parent_dir(instance_id, &to).await?;

        fs::rename(&host_from, &host_to).await?;

        tracing::debug!(instance_id, from, to, "renamed workspace node");
        let _ = self.inner.changes.send(WorkspaceChange::Renamed {
            instance_id: instance_id.to_string(),
            from,
            to: to.clone(),
        });

        let metadata = fs::metadata(&host_to).await?;
        Ok(node_from_metadata(to, &metadata))
    }

    /// Lists every node in the workspace except the root, ordered by path.
    pub async fn tree(&self, instance_id: &str) -> NexusResult<Vec<WorkspaceNode>> {
        let _guard = self.read_lock(instance_id).await;
        let dir = self.workspace_dir(instance_id).await?;

        let mut nodes = tokio::task::spawn_blocking(move || {
            let mut nodes = Vec::new();
            for entry in WalkDir::new(&dir).min_depth(1).follow_links(false) {
                let Ok(entry) = entry else { continue };
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                let Ok(relative) = entry.path().strip_prefix(&dir) else {
                    continue;
                };
                let Some(relative) = relative.to_str() else {
                    continue;
                };

                nodes.push(node_from_metadata(format!("/{}", relative), &metadata));
            }
            nodes
        })
        .await?;

        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(nodes)
    }

    /// Total size in bytes of every file in the workspace.
    pub async fn disk_usage(&self, instance_id: &str) -> NexusResult<u64> {
        let dir = self.workspace_dir(instance_id).await?;
        Ok(tokio::task::spawn_blocking(move || disk_usage_blocking(&dir)).await?)
    }
}

impl WorkspaceStore {
    async fn read_lock(&self, instance_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(instance_id).read_owned().await
    }

    async fn write_lock(&self, instance_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(instance_id).write_owned().await
    }

    fn lock_for(&self, instance_id: &str) -> Arc<RwLock<()>> {
        let mut locks = match self.inner.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };

        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }

    fn forget_lock(&self, instance_id: &str) {
        if let Ok(mut locks) = self.inner.locks.lock() {
            locks.remove(instance_id);
        }
    }

    /// The workspace directory, which must exist.
    async fn workspace_dir(&self, instance_id: &str) -> NexusResult<PathBuf> {
        validate_instance_id(instance_id)?;
        let dir = self.dir(instance_id);
        if !fs::try_exists(&dir).await? {
            return Err(NexusError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(dir)
    }

    /// Canonicalizes `path` and maps it to a host path inside the workspace.
    async fn resolve(&self, instance_id: &str, path: &str) -> NexusResult<(String, PathBuf)> {
        let dir = self.workspace_dir(instance_id).await?;
        let path =
            canonicalize_path(path).map_err(|e| NexusError::InvalidPath(e.to_string()))?;

        let host_path = if path == WORKSPACE_ROOT {
            dir.clone()
        } else {
            dir.join(path.trim_start_matches('/'))
        };

        ensure_contained(&dir, &host_path).await?;
        Ok((path, host_path))
    }

    async fn ensure_parent_dir(&self, instance_id: &str, path: &str) -> NexusResult<()> {
        let Some(parent) = parent_path(path) else {
            return Ok(());
        };

        let host_parent = if parent == WORKSPACE_ROOT {
            self.dir(instance_id)
        } else {
            self.dir(instance_id).join(parent.trim_start_matches('/'))
        };

        match fs::metadata(&host_parent).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(NexusError::InvalidPath(format!(
                "not a directory: {}",
                parent
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(NexusError::PathNotFound(parent.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks that replacing `replaced_size` bytes with `new_size` keeps the workspace within
    /// its quota.
    async fn ensure_quota(
        &self,
        instance_id: &str,
        path: &str,
        replaced_size: u64,
        new_size: u64,
    ) -> NexusResult<()> {
        let quota = match self.inner.quotas.lock() {
            Ok(quotas) => quotas.get(instance_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(instance_id).copied(),
        };
        let Some(quota) = quota else {
            return Ok(());
        };

        let dir = self.dir(instance_id);
        let used = tokio::task::spawn_blocking(move || disk_usage_blocking(&dir)).await?;
        let after = used.saturating_sub(replaced_size).saturating_add(new_size);
        if after > quota {
            tracing::warn!(instance_id, path, used, after, quota, "write exceeds workspace quota");
            return Err(NexusError::ResourceExhausted(format!(
                "workspace quota exceeded: writing {} would use {} of {} bytes",
                path, after, quota
            )));
        }

        Ok(())
    }

    async fn remove_via_trash(&self, host_path: &Path) -> NexusResult<()> {
        let trash = self
            .inner
            .root
            .join(TRASH_DIR)
            .join(Uuid::new_v4().simple().to_string());
        fs::rename(host_path, &trash).await?;

        let metadata = fs::symlink_metadata(&trash).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(&trash).await?;
        } else {
            fs::remove_file(&trash).await?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Total size in bytes of every regular file below `dir`. Unreadable entries are skipped.
pub fn disk_usage_blocking(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

fn validate_instance_id(instance_id: &str) -> NexusResult<()> {
    let valid = !instance_id.is_empty()
        && !instance_id.starts_with('.')
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !valid {
        return Err(NexusError::InstanceNotFound(instance_id.to_string()));
    }

    Ok(())
}

/// Rejects paths that leave the workspace through a symlink.
async fn ensure_contained(dir: &Path, host_path: &Path) -> NexusResult<()> {
    let dir = fs::canonicalize(dir).await?;

    let mut existing = host_path.to_path_buf();
    loop {
        match fs::canonicalize(&existing).await {
            Ok(real) => {
                if real.starts_with(&dir) {
                    return Ok(());
                }
                return Err(NexusError::PermissionDenied(
                    "path resolves outside the workspace".to_string(),
                ));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !existing.pop() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn metadata_or_not_found(host_path: &Path, path: &str) -> NexusResult<std::fs::Metadata> {
    match fs::metadata(host_path).await {
        Ok(metadata) => Ok(metadata),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(NexusError::PathNotFound(path.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn already_exists_or(error: std::io::Error, path: &str) -> NexusError {
    match error.kind() {
        ErrorKind::AlreadyExists => NexusError::AlreadyExists(path.to_string()),
        _ => error.into(),
    }
}

fn node_from_metadata(path: String, metadata: &std::fs::Metadata) -> WorkspaceNode {
    let kind = if metadata.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::File
    };

    let modified_at = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    WorkspaceNode {
        name: file_name(&path).to_string(),
        size: if kind == NodeKind::File {
            metadata.len()
        } else {
            0
        },
        path,
        kind,
        modified_at,
    }
}

fn sort_nodes(nodes: &mut [WorkspaceNode]) {
    nodes.sort_by(|a, b| {
        let a_dir = a.kind == NodeKind::Directory;
        let b_dir = b.kind == NodeKind::Directory;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
