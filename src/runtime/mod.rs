//! Java runtime resolution for server launches.
//!
//! Acquiring JDKs is someone else's job; the core only asks a
//! [`RuntimeResolver`] for the runtime home to export before spawning.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    /// Runtime home (the directory containing `bin/java`) suitable for the
    /// given game version.
    async fn resolve(&self, game_version: Option<&str>) -> Result<PathBuf>;
}

/// Uses the configured `java_home`, falling back to the `JAVA_HOME`
/// environment variable.
pub struct JavaHomeResolver {
    java_home: Option<PathBuf>,
}

impl JavaHomeResolver {
    pub fn new(java_home: Option<PathBuf>) -> Self {
        Self { java_home }
    }
}

#[async_trait]
impl RuntimeResolver for JavaHomeResolver {
    async fn resolve(&self, game_version: Option<&str>) -> Result<PathBuf> {
        let home = match &self.java_home {
            Some(path) => path.clone(),
            None => std::env::var_os("JAVA_HOME").map(PathBuf::from).ok_or_else(|| {
                anyhow::anyhow!(
                    "No Java runtime for game version {}: set java_home or JAVA_HOME",
                    game_version.unwrap_or("<unspecified>")
                )
            })?,
        };

        if !home.is_dir() {
            anyhow::bail!("Java runtime directory does not exist: {}", home.display());
        }
        tracing::debug!("Resolved Java runtime {}", home.display());
        Ok(home)
    }
}

/// `PATH` value with `<runtime>/bin` in front of the current one.
pub fn path_with_runtime(runtime: &Path) -> std::ffi::OsString {
    let bin = runtime.join("bin");
    let mut paths = vec![bin];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_else(|e| {
        tracing::warn!("Could not extend PATH with runtime bin: {}", e);
        std::env::var_os("PATH").unwrap_or_default()
    })
}
