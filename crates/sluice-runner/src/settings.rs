//! Settings for the `sluice` binary and embedders.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `SLUICE__<SECTION>__<KEY>` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::{
    ContainerRuntime, DEFAULT_IMAGE_PREFIX, DEFAULT_MOUNT_ALIAS, RuntimeType,
};
use crate::runner::Timeouts;

pub const APP_NAME: &str = "sluice";
const ENV_PREFIX: &str = "SLUICE";

/// Which container CLI to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker if available, otherwise Podman.
    #[default]
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub kind: RuntimeKind,
    /// Path to the container binary, overriding `kind`'s default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    pub image_prefix: String,
    /// Host side of the workspace mount: a named volume or a host path.
    pub workspace_volume: String,
    /// Where the workspace is visible inside connector containers.
    pub mount_alias: String,
    /// Host directory backing the workspace, where configs are materialized.
    /// Defaults to `workspace_volume` when that is a path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let workspace = default_data_dir()
            .unwrap_or_else(|_| PathBuf::from("/var/lib").join(APP_NAME))
            .join("workspace");
        Self {
            kind: RuntimeKind::Auto,
            binary: None,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            workspace_volume: workspace.display().to_string(),
            mount_alias: DEFAULT_MOUNT_ALIAS.to_string(),
            config_dir: None,
        }
    }
}

/// Deadlines in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub spec_secs: u64,
    pub check_secs: u64,
    pub discover_secs: u64,
    pub read_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            spec_secs: 60,
            check_secs: 60,
            discover_secs: 60,
            read_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub timeouts: TimeoutSettings,
}

impl Settings {
    /// Load settings from `path` (optional) layered over defaults and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("runtime.kind", "auto")?
            .set_default("runtime.image_prefix", defaults.runtime.image_prefix)?
            .set_default("runtime.workspace_volume", defaults.runtime.workspace_volume)?
            .set_default("runtime.mount_alias", defaults.runtime.mount_alias)?
            .set_default("timeouts.spec_secs", defaults.timeouts.spec_secs)?
            .set_default("timeouts.check_secs", defaults.timeouts.check_secs)?
            .set_default("timeouts.discover_secs", defaults.timeouts.discover_secs)?
            .set_default("timeouts.read_secs", defaults.timeouts.read_secs)?;

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("building settings")?;

        let mut settings: Settings = built
            .try_deserialize()
            .context("deserializing settings")?;
        settings.expand_paths()?;
        Ok(settings)
    }

    fn expand_paths(&mut self) -> Result<()> {
        if looks_like_path(&self.runtime.workspace_volume) {
            self.runtime.workspace_volume = expand_str_path(&self.runtime.workspace_volume)?
                .display()
                .to_string();
        }
        if let Some(dir) = &self.runtime.config_dir {
            self.runtime.config_dir = Some(expand_str_path(dir)?.display().to_string());
        }
        if let Some(binary) = &self.runtime.binary {
            self.runtime.binary = Some(expand_str_path(binary)?.display().to_string());
        }
        Ok(())
    }

    /// Host directory configs are materialized into.
    pub fn config_dir(&self) -> Result<PathBuf> {
        match &self.runtime.config_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None if looks_like_path(&self.runtime.workspace_volume) => {
                Ok(PathBuf::from(&self.runtime.workspace_volume))
            }
            None => Err(anyhow!(
                "runtime.config_dir must be set when workspace_volume ({}) is a named volume",
                self.runtime.workspace_volume
            )),
        }
    }

    /// Container runtime described by these settings.
    pub fn container_runtime(&self) -> Result<ContainerRuntime> {
        let config_dir = self.config_dir()?;
        let volume = self.runtime.workspace_volume.clone();
        let runtime = match self.runtime.kind {
            RuntimeKind::Auto => ContainerRuntime::new(volume, config_dir),
            RuntimeKind::Docker => ContainerRuntime::with_type(RuntimeType::Docker, volume, config_dir),
            RuntimeKind::Podman => ContainerRuntime::with_type(RuntimeType::Podman, volume, config_dir),
        };
        let runtime = runtime
            .image_prefix(self.runtime.image_prefix.clone())
            .mount_at(self.runtime.mount_alias.clone());
        Ok(match &self.runtime.binary {
            Some(binary) => runtime.binary_path(binary.clone()),
            None => runtime,
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            spec: Duration::from_secs(self.timeouts.spec_secs),
            check: Duration::from_secs(self.timeouts.check_secs),
            read: Duration::from_secs(self.timeouts.read_secs),
        }
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.discover_secs)
    }

    /// Write the default settings as commented TOML.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }

        let toml = toml::to_string_pretty(&Settings::default())
            .context("serializing default settings to TOML")?;
        let mut body = String::new();
        body.push_str("# Configuration for ");
        body.push_str(APP_NAME);
        body.push('\n');
        body.push_str("# File: ");
        body.push_str(&path.display().to_string());
        body.push_str("\n# Every key can be overridden with SLUICE__<SECTION>__<KEY>.\n\n");
        body.push_str(&toml);
        fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
    }
}

fn looks_like_path(value: &str) -> bool {
    value.starts_with('/') || value.starts_with('~') || value.starts_with('.') || value.starts_with('$')
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

/// `$XDG_CONFIG_HOME/sluice/config.toml` or the platform equivalent.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}
