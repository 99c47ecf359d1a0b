//! Server provisioning port.
//!
//! The registry calls a [`Provisioner`] once per create job. The bundled
//! [`DirectoryProvisioner`] only lays out the data directory; fetching the
//! actual server jar is left to a richer implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::registry::ServerType;
use crate::utils::LAUNCH_SCRIPT;

const DEFAULT_HEAP_GB: u32 = 4;

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Install a server named `name` under `parent` and return its data
    /// directory.
    async fn provision(
        &self,
        name: &str,
        server_type: ServerType,
        game_version: Option<&str>,
        parent: &Path,
    ) -> Result<PathBuf>;
}

/// Creates `<parent>/<name>` with an accepted EULA, the add-on folder for the
/// distribution and a launch script for `server.jar`.
pub struct DirectoryProvisioner {
    heap_gb: u32,
}

impl DirectoryProvisioner {
    pub fn new() -> Self {
        Self { heap_gb: DEFAULT_HEAP_GB }
    }

    pub fn with_heap_gb(heap_gb: u32) -> Self {
        Self { heap_gb }
    }

    fn launch_script(&self) -> String {
        if cfg!(target_os = "windows") {
            format!(
                "@echo off\r\njava -Xmx{gb}G -Xms{gb}G -jar server.jar %*\r\n",
                gb = self.heap_gb
            )
        } else {
            format!(
                "#!/bin/sh\nexec java -Xmx{gb}G -Xms{gb}G -jar server.jar \"$@\"\n",
                gb = self.heap_gb
            )
        }
    }

    async fn lay_out(&self, dir: &Path, server_type: ServerType) -> Result<()> {
        tokio::fs::write(dir.join("eula.txt"), "eula=true\n").await?;
        tokio::fs::create_dir(dir.join(server_type.mod_kind().folder_name())).await?;
        tokio::fs::write(dir.join(LAUNCH_SCRIPT), self.launch_script()).await?;
        Ok(())
    }
}

impl Default for DirectoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for DirectoryProvisioner {
    async fn provision(
        &self,
        name: &str,
        server_type: ServerType,
        game_version: Option<&str>,
        parent: &Path,
    ) -> Result<PathBuf> {
        let dir = parent.join(name);
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
        // create_dir (not _all): an existing folder means a name clash on disk
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("creating server directory {}", dir.display()))?;

        if let Err(e) = self.lay_out(&dir, server_type).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!("Could not clean up {}: {}", dir.display(), cleanup);
            }
            return Err(e.context(format!("provisioning '{}'", name)));
        }

        tracing::info!(
            "Provisioned {} server '{}' (version {}) at {}",
            server_type,
            name,
            game_version.unwrap_or("latest"),
            dir.display()
        );
        Ok(dir)
    }
}
