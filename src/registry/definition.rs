use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::notify::NotifyConfig;

/// Server distribution a definition was provisioned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerType {
    Spigot,
    Forge,
    Neoforge,
    Fabric,
}

/// Where add-ons live for a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModKind {
    Mods,
    Plugins,
}

impl ModKind {
    pub fn folder_name(self) -> &'static str {
        match self {
            Self::Mods => "mods",
            Self::Plugins => "plugins",
        }
    }
}

impl ServerType {
    pub fn mod_kind(self) -> ModKind {
        match self {
            Self::Forge | Self::Neoforge | Self::Fabric => ModKind::Mods,
            Self::Spigot => ModKind::Plugins,
        }
    }

    pub fn is_modded(self) -> bool {
        self.mod_kind() == ModKind::Mods
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spigot => "SPIGOT",
            Self::Forge => "FORGE",
            Self::Neoforge => "NEOFORGE",
            Self::Fabric => "FABRIC",
        }
    }
}

impl std::str::FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SPIGOT" => Ok(Self::Spigot),
            "FORGE" => Ok(Self::Forge),
            "NEOFORGE" => Ok(Self::Neoforge),
            "FABRIC" => Ok(Self::Fabric),
            other => Err(format!("unknown server type '{}'", other)),
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One managed server, with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    pub name: String,
    pub server_type: ServerType,
    pub game_version: Option<String>,
    pub server_location: PathBuf,
    pub backup_location: PathBuf,
    pub notify: Option<NotifyConfig>,
}
