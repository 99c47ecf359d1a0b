//! servers.json persistence and path portability.
//!
//! Paths under one of the well-known roots are stored with a placeholder
//! prefix so the file keeps working when the installation moves:
//!
//! ```text
//! {
//!   "survival": {
//!     "server_type": "FABRIC",
//!     "game_version": "1.20.1",
//!     "server_folder": "{SERVERS_ROOT}/survival",
//!     "backup_folder": "{BACKUPS_ROOT}/survival"
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::definition::{ServerDefinition, ServerType};
use crate::notify::NotifyConfig;

pub const INSTALL_ROOT_TOKEN: &str = "{INSTALL_ROOT}";
pub const SERVERS_ROOT_TOKEN: &str = "{SERVERS_ROOT}";
pub const BACKUPS_ROOT_TOKEN: &str = "{BACKUPS_ROOT}";

// ─── Path roots ──────────────────────────────────────────────

/// The three directories stored paths may be relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRoots {
    pub install_root: PathBuf,
    pub servers_root: PathBuf,
    pub backups_root: PathBuf,
}

impl PathRoots {
    fn tokens(&self) -> [(&'static str, &Path); 3] {
        [
            (SERVERS_ROOT_TOKEN, self.servers_root.as_path()),
            (BACKUPS_ROOT_TOKEN, self.backups_root.as_path()),
            (INSTALL_ROOT_TOKEN, self.install_root.as_path()),
        ]
    }

    /// Replace the deepest matching root with its placeholder.
    pub fn collapse(&self, path: &Path) -> String {
        let best = self
            .tokens()
            .into_iter()
            .filter_map(|(token, root)| path.strip_prefix(root).ok().map(|rest| (token, root, rest)))
            .max_by_key(|(_, root, _)| root.components().count());

        match best {
            Some((token, _, rest)) => {
                let segments: Vec<String> = rest
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect();
                if segments.is_empty() {
                    token.to_string()
                } else {
                    format!("{}/{}", token, segments.join("/"))
                }
            }
            None => path.to_string_lossy().into_owned(),
        }
    }

    /// Resolve a stored path back to an absolute one.
    pub fn expand(&self, stored: &str) -> PathBuf {
        for (token, root) in self.tokens() {
            let Some(rest) = stored.strip_prefix(token) else {
                continue;
            };
            if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\')) {
                continue;
            }
            let mut path = root.to_path_buf();
            for segment in rest.split(['/', '\\']).filter(|s| !s.is_empty()) {
                path.push(segment);
            }
            return path;
        }
        PathBuf::from(stored)
    }
}

// ─── Stored records ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredServer {
    #[serde(default = "legacy_server_type")]
    server_type: ServerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    game_version: Option<String>,
    server_folder: String,
    backup_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notify: Option<NotifyConfig>,
}

/// Files written before the type field existed only held Spigot servers.
fn legacy_server_type() -> ServerType {
    ServerType::Spigot
}

/// Reads and writes the definition file. Not synchronized on its own; the
/// registry serializes writers.
pub struct DefinitionStore {
    file_path: PathBuf,
    roots: PathRoots,
}

impl DefinitionStore {
    pub fn new(file_path: impl Into<PathBuf>, roots: PathRoots) -> Self {
        Self {
            file_path: file_path.into(),
            roots,
        }
    }

    pub fn roots(&self) -> &PathRoots {
        &self.roots
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Load all definitions. A missing file is an empty registry.
    pub fn load(&self) -> Result<Vec<ServerDefinition>> {
        if !self.file_path.exists() {
            tracing::info!(
                "Definition file {} does not exist, starting empty",
                self.file_path.display()
            );
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.file_path)
            .with_context(|| format!("reading {}", self.file_path.display()))?;
        let stored: BTreeMap<String, StoredServer> = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.file_path.display()))?;

        let definitions: Vec<ServerDefinition> = stored
            .into_iter()
            .map(|(name, s)| ServerDefinition {
                name,
                server_type: s.server_type,
                game_version: s.game_version,
                server_location: self.roots.expand(&s.server_folder),
                backup_location: self.roots.expand(&s.backup_folder),
                notify: s.notify,
            })
            .collect();
        tracing::info!("Loaded {} server definitions", definitions.len());
        Ok(definitions)
    }

    /// Write all definitions, replacing the file atomically.
    pub fn save(&self, definitions: &[ServerDefinition]) -> Result<()> {
        let stored: BTreeMap<String, StoredServer> = definitions
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    StoredServer {
                        server_type: d.server_type,
                        game_version: d.game_version.clone(),
                        server_folder: self.roots.collapse(&d.server_location),
                        backup_folder: self.roots.collapse(&d.backup_location),
                        notify: d.notify.clone(),
                    },
                )
            })
            .collect();

        let content = serde_json::to_string_pretty(&stored)?;
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.file_path)
            .with_context(|| format!("replacing {}", self.file_path.display()))?;
        tracing::info!("Saved {} server definitions", definitions.len());
        Ok(())
    }
}
