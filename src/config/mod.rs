//! Dashboard configuration loaded from `config/dashboard.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::notify::Language;
use crate::process::ProcessOptions;
use crate::registry::PathRoots;

pub const DEFAULT_CONFIG_PATH: &str = "config/dashboard.toml";
pub const CONFIG_ENV: &str = "PROTON_CONFIG";

/// `config/dashboard.toml`
///
/// Relative paths are resolved against `install_root`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DashboardConfig {
    pub servers_file: Option<PathBuf>,
    pub install_root: Option<PathBuf>,
    pub servers_root: Option<PathBuf>,
    pub backups_root: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub language: Language,
    pub output_join_timeout_secs: Option<u64>,
    pub stop_command: Option<String>,
}

impl DashboardConfig {
    /// `$PROTON_CONFIG` if set, else `config/dashboard.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// 파일이 없으면 기본값, 파싱 실패는 에러
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Self = toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn install_root(&self) -> PathBuf {
        self.install_root.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|e| {
                tracing::warn!("Cannot read current directory ({}), using '.'", e);
                PathBuf::from(".")
            })
        })
    }

    fn under_root(&self, value: Option<&PathBuf>, default: &str) -> PathBuf {
        let root = self.install_root();
        match value {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => root.join(default),
        }
    }

    pub fn roots(&self) -> PathRoots {
        PathRoots {
            install_root: self.install_root(),
            servers_root: self.under_root(self.servers_root.as_ref(), "servers"),
            backups_root: self.under_root(self.backups_root.as_ref(), "backups"),
        }
    }

    pub fn servers_file(&self) -> PathBuf {
        self.under_root(self.servers_file.as_ref(), "servers.json")
    }

    pub fn process_options(&self) -> ProcessOptions {
        let defaults = ProcessOptions::default();
        ProcessOptions {
            stop_command: self.stop_command.clone().unwrap_or(defaults.stop_command),
            output_join_timeout: self
                .output_join_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.output_join_timeout),
        }
    }
}
