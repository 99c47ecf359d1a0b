//! Server registry
//!
//! The authoritative set of server definitions and the [`ServerProcess`]
//! built for each of them. All access to the in-memory collection goes
//! through one mutex; writes of the definition file are serialized by a
//! separate async lock so concurrent create/delete jobs cannot interleave
//! partial files.

pub mod definition;
pub mod store;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::notify::{NotificationSink, Notifier};
use crate::process::{ProcessOptions, ServerProcess, ServerStatus};
use crate::provision::Provisioner;
use crate::runtime::RuntimeResolver;

pub use self::definition::{ModKind, ServerDefinition, ServerType};
pub use self::store::{DefinitionStore, PathRoots};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Server '{0}' already exists")]
    DuplicateName(String),

    #[error("Server '{0}' not found")]
    UnknownName(String),

    #[error("Invalid server name '{0}'")]
    InvalidName(String),

    #[error("Server '{0}' is not stopped; stop it first")]
    StillRunning(String),

    #[error("Server '{0}' is already being deleted")]
    DeleteInProgress(String),

    #[error("Provisioning of '{name}' failed: {reason}")]
    ProvisionFailed { name: String, reason: String },

    #[error("Failed to load server definitions: {0}")]
    Load(String),

    #[error("Failed to save server definitions: {0}")]
    Persist(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::UnknownName(_) => "SERVER_NOT_FOUND",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::StillRunning(_) => "ALREADY_RUNNING",
            Self::DeleteInProgress(_) => "DELETE_IN_PROGRESS",
            Self::ProvisionFailed { .. } => "PROVISION_FAILED",
            Self::Load(_) => "LOAD_FAILED",
            Self::Persist(_) => "PERSIST_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

#[derive(Default)]
struct Inner {
    servers: Vec<Arc<ServerProcess>>,
    /// Names with a create job in flight (`CREATING` overlay).
    provisioning: HashSet<String>,
    /// Names with a delete job in flight.
    deleting: HashSet<String>,
}

pub struct ServerRegistry {
    store: DefinitionStore,
    provisioner: Arc<dyn Provisioner>,
    runtime: Arc<dyn RuntimeResolver>,
    sink: Arc<dyn NotificationSink>,
    options: ProcessOptions,
    inner: Mutex<Inner>,
    save_lock: tokio::sync::Mutex<()>,
}

impl ServerRegistry {
    pub fn new(
        store: DefinitionStore,
        provisioner: Arc<dyn Provisioner>,
        runtime: Arc<dyn RuntimeResolver>,
        sink: Arc<dyn NotificationSink>,
        options: ProcessOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provisioner,
            runtime,
            sink,
            options,
            inner: Mutex::new(Inner::default()),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Per-server notifier tasks are spawned here, so this must run inside
    /// a tokio runtime.
    fn build_process(&self, definition: ServerDefinition) -> Arc<ServerProcess> {
        let notifier = Notifier::spawn(Arc::clone(&self.sink), definition.notify.clone());
        ServerProcess::new(definition, notifier, Arc::clone(&self.runtime), self.options.clone())
    }

    /// (Re)build the registry from the definition file. Returns the number of
    /// servers loaded.
    pub fn load(&self) -> Result<usize, RegistryError> {
        let definitions = self
            .store
            .load()
            .map_err(|e| RegistryError::Load(format!("{:#}", e)))?;
        let servers: Vec<Arc<ServerProcess>> = definitions
            .into_iter()
            .map(|definition| self.build_process(definition))
            .collect();

        let count = servers.len();
        self.lock_inner().servers = servers;
        tracing::info!("Registry loaded with {} servers", count);
        Ok(count)
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let _guard = self.save_lock.lock().await;
        // snapshot under the save lock so the last writer always writes the latest state
        let definitions: Vec<ServerDefinition> = self
            .lock_inner()
            .servers
            .iter()
            .map(|p| p.definition().clone())
            .collect();
        self.store
            .save(&definitions)
            .map_err(|e| RegistryError::Persist(format!("{:#}", e)))
    }

    // ─── Create ──────────────────────────────────────────────

    /// Reject duplicates now, provision in the background.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        server_type: ServerType,
        game_version: Option<String>,
    ) -> Result<JoinHandle<Result<Arc<ServerProcess>, RegistryError>>, RegistryError> {
        validate_name(name)?;
        {
            let mut inner = self.lock_inner();
            if inner.provisioning.contains(name) || inner.servers.iter().any(|p| p.name() == name) {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
            inner.provisioning.insert(name.to_string());
        }
        tracing::info!("Creating {} server '{}'", server_type, name);

        let this = Arc::clone(self);
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let result = this.provision_and_register(&name, server_type, game_version).await;
            if let Err(e) = &result {
                this.lock_inner().provisioning.remove(&name);
                tracing::error!("Creating '{}' failed: {}", name, e);
            }
            result
        }))
    }

    async fn provision_and_register(
        &self,
        name: &str,
        server_type: ServerType,
        game_version: Option<String>,
    ) -> Result<Arc<ServerProcess>, RegistryError> {
        let roots = self.store.roots();
        let data_dir = self
            .provisioner
            .provision(name, server_type, game_version.as_deref(), &roots.servers_root)
            .await
            .map_err(|e| RegistryError::ProvisionFailed {
                name: name.to_string(),
                reason: format!("{:#}", e),
            })?;

        let process = self.build_process(ServerDefinition {
            name: name.to_string(),
            server_type,
            game_version,
            server_location: data_dir,
            backup_location: roots.backups_root.join(name),
            notify: None,
        });
        {
            // marker and entry swap in one step, so the name is never free in between
            let mut inner = self.lock_inner();
            inner.provisioning.remove(name);
            inner.servers.push(Arc::clone(&process));
        }
        if let Err(e) = self.persist().await {
            // memory and file must agree; drop the entry and the fresh directory
            self.lock_inner().servers.retain(|p| !Arc::ptr_eq(p, &process));
            if let Err(rm) = tokio::fs::remove_dir_all(process.data_dir()).await {
                tracing::warn!("Could not remove {}: {}", process.data_dir().display(), rm);
            }
            return Err(e);
        }
        tracing::info!("Server '{}' created", name);
        Ok(process)
    }

    // ─── Delete ──────────────────────────────────────────────

    /// Reject unknown names and servers that are not stopped now, tear down
    /// in the background. An accepted server can no longer be started.
    pub fn delete(self: &Arc<Self>, name: &str) -> Result<JoinHandle<Result<(), RegistryError>>, RegistryError> {
        let process = {
            let mut inner = self.lock_inner();
            let process = inner
                .servers
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
            if inner.deleting.contains(name) {
                return Err(RegistryError::DeleteInProgress(name.to_string()));
            }
            if !process.retire() {
                return Err(RegistryError::StillRunning(name.to_string()));
            }
            inner.deleting.insert(name.to_string());
            process
        };
        tracing::info!("Deleting server '{}'", name);

        let this = Arc::clone(self);
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            let result = this.tear_down(&process).await;
            if result.is_err() && this.get_by_name(&name).is_some() {
                process.unretire();
            }
            this.lock_inner().deleting.remove(&name);
            match &result {
                Ok(()) => tracing::info!("Server '{}' deleted", name),
                Err(e) => tracing::error!("Deleting '{}' failed: {}", name, e),
            }
            result
        }))
    }

    async fn tear_down(&self, process: &Arc<ServerProcess>) -> Result<(), RegistryError> {
        self.lock_inner().provisioning.remove(process.name());

        match tokio::fs::remove_dir_all(process.data_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Data directory {} already gone", process.data_dir().display());
            }
            Err(e) => return Err(e.into()),
        }

        self.lock_inner().servers.retain(|p| !Arc::ptr_eq(p, process));
        remove_dir_if_empty(process.backup_dir());
        self.persist().await
    }

    // ─── Queries ─────────────────────────────────────────────

    pub fn get_by_name(&self, name: &str) -> Option<Arc<ServerProcess>> {
        self.lock_inner().servers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ServerProcess>> {
        self.lock_inner().servers.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock_inner().servers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Names whose create job has not finished yet.
    pub fn provisioning(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_inner().provisioning.iter().cloned().collect();
        names.sort();
        names
    }

    /// Process status, or `Creating` while the name is being provisioned.
    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        let process = {
            let inner = self.lock_inner();
            if inner.provisioning.contains(name) {
                return Some(ServerStatus::Creating);
            }
            inner.servers.iter().find(|p| p.name() == name).cloned()
        };
        process.map(|p| p.status())
    }

    /// Send the stop command to every live server and wait for each, up to
    /// `timeout` per server.
    pub async fn stop_all(&self, timeout: Duration) {
        let live: Vec<Arc<ServerProcess>> = self.list().into_iter().filter(|p| p.stop()).collect();
        for process in live {
            if tokio::time::timeout(timeout, process.wait_for_exit()).await.is_err() {
                tracing::warn!("Server '{}' did not stop within {:?}", process.name(), timeout);
            }
        }
    }
}

/// Names double as directory names.
fn validate_name(name: &str) -> Result<(), RegistryError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
    {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn remove_dir_if_empty(dir: &Path) {
    let empty = match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return,
    };
    if !empty {
        tracing::info!("Keeping non-empty backup directory {}", dir.display());
        return;
    }
    if let Err(e) = std::fs::remove_dir(dir) {
        tracing::warn!("Could not remove backup directory {}: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TracingSink;
    use crate::provision::DirectoryProvisioner;
    use crate::runtime::JavaHomeResolver;
    use std::path::PathBuf;

    /// Parks every resolve until released, then reports no JDK.
    struct GatedRuntime(Arc<tokio::sync::Notify>);

    #[async_trait::async_trait]
    impl RuntimeResolver for GatedRuntime {
        async fn resolve(&self, _game_version: Option<&str>) -> anyhow::Result<PathBuf> {
            self.0.notified().await;
            anyhow::bail!("no JDK installed")
        }
    }

    fn registry(base: &Path) -> Arc<ServerRegistry> {
        registry_with_runtime(base, Arc::new(JavaHomeResolver::new(Some(PathBuf::from("/nonexistent/jdk")))))
    }

    fn registry_with_runtime(base: &Path, runtime: Arc<dyn RuntimeResolver>) -> Arc<ServerRegistry> {
        let roots = PathRoots {
            install_root: base.to_path_buf(),
            servers_root: base.join("servers"),
            backups_root: base.join("backups"),
        };
        ServerRegistry::new(
            DefinitionStore::new(base.join("servers.json"), roots),
            Arc::new(DirectoryProvisioner::new()),
            runtime,
            Arc::new(TracingSink::new(Default::default())),
            ProcessOptions::default(),
        )
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("survival").is_ok());
        assert!(validate_name("My Server").is_ok());
        for bad in ["", " ", "..", ".", "a/b", "a\\b", " padded"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        assert_eq!(reg.load().unwrap(), 0);

        let job = reg.create("survival", ServerType::Fabric, Some("1.20.1".into())).unwrap();
        let process = job.await.unwrap().unwrap();
        assert_eq!(process.data_dir(), tmp.path().join("servers").join("survival"));
        assert_eq!(reg.status("survival"), Some(ServerStatus::Stopped));
        assert!(reg.provisioning().is_empty());

        let duplicate = reg.create("survival", ServerType::Spigot, None).unwrap_err();
        assert_eq!(duplicate.error_code(), "DUPLICATE_NAME");

        reg.delete("survival").unwrap().await.unwrap().unwrap();
        assert!(reg.get_by_name("survival").is_none());
        assert!(!tmp.path().join("servers").join("survival").exists());
        // the empty backup folder goes with it
        assert!(!tmp.path().join("backups").join("survival").exists());

        let reloaded = registry(tmp.path());
        assert_eq!(reloaded.load().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let err = reg.delete("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownName(_)));
    }

    #[tokio::test]
    async fn test_failed_provision_leaves_registry_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("servers").join("taken")).unwrap();
        let reg = registry(tmp.path());

        let result = reg.create("taken", ServerType::Forge, None).unwrap().await.unwrap();
        assert!(matches!(result, Err(RegistryError::ProvisionFailed { .. })));
        assert!(reg.names().is_empty());
        assert!(reg.status("taken").is_none());
        assert!(!tmp.path().join("servers.json").exists());
    }

    #[tokio::test]
    async fn test_delete_keeps_non_empty_backup_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.create("creative", ServerType::Spigot, None).unwrap().await.unwrap().unwrap();
        let backup_dir = tmp.path().join("backups").join("creative");
        std::fs::write(backup_dir.join("1-2-2024_10-30.zip"), b"zip").unwrap();

        reg.delete("creative").unwrap().await.unwrap().unwrap();
        assert!(backup_dir.join("1-2-2024_10-30.zip").exists());
    }

    #[tokio::test]
    async fn test_starting_server_cannot_be_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let reg = registry_with_runtime(tmp.path(), Arc::new(GatedRuntime(gate.clone())));
        let process = reg.create("survival", ServerType::Spigot, None).unwrap().await.unwrap().unwrap();

        let starting = tokio::spawn({
            let process = Arc::clone(&process);
            async move { process.start().await }
        });
        while process.status() != ServerStatus::Starting {
            tokio::task::yield_now().await;
        }
        let err = reg.delete("survival").unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_RUNNING");

        gate.notify_one();
        assert!(starting.await.unwrap().is_err());
        assert_eq!(process.status(), ServerStatus::Stopped);
        assert!(tmp.path().join("servers").join("survival").is_dir());
    }

    #[tokio::test]
    async fn test_accepted_delete_blocks_start() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let process = reg.create("survival", ServerType::Spigot, None).unwrap().await.unwrap().unwrap();

        let job = reg.delete("survival").unwrap();
        let err = process.start().await.unwrap_err();
        assert_eq!(err.error_code(), "SERVER_REMOVED");
        job.await.unwrap().unwrap();
        assert!(!tmp.path().join("servers").join("survival").exists());
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back_create() {
        let tmp = tempfile::tempdir().unwrap();
        // a directory where the file should go makes the final rename fail
        std::fs::create_dir_all(tmp.path().join("servers.json")).unwrap();
        let reg = registry(tmp.path());

        let result = reg.create("survival", ServerType::Fabric, None).unwrap().await.unwrap();
        assert_eq!(result.unwrap_err().error_code(), "PERSIST_FAILED");
        assert!(reg.names().is_empty());
        assert!(reg.status("survival").is_none());
        assert!(!tmp.path().join("servers").join("survival").exists());
    }
}
