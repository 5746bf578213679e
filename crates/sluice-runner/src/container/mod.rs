//! Container runtime management module.
//!
//! Connectors are shipped as images and executed with `docker run` or
//! `podman run`. The [`ImageRuntime`] trait is everything the runner needs
//! from the container side; [`ContainerRuntime`] implements it on top of the
//! docker/podman CLI. The runtime is auto-detected or can be configured
//! explicitly.

mod error;
mod validate;

pub use error::{ContainerError, ContainerResult};
pub use validate::{
    sanitize_container_name, validate_container_name, validate_image_name, validate_volume_path,
};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Image namespace prepended to bare connector names.
pub const DEFAULT_IMAGE_PREFIX: &str = "airbyte/";

/// Path the workspace volume is mounted at inside connector containers.
pub const DEFAULT_MOUNT_ALIAS: &str = "/tmp/sluice";

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// What the runner needs from the container runtime.
///
/// Injected into every [`Runner`](crate::Runner) at construction, so tests
/// and embedders can substitute their own.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Program used to run connectors.
    fn binary(&self) -> &str;

    /// Arguments placed before the `run` subcommand (e.g. `--context prod`).
    fn global_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `image:version` is available locally.
    async fn is_pulled(&self, image: &str, version: &str) -> bool;

    /// Namespace a bare connector image name.
    fn qualify(&self, image: &str) -> String;

    /// Host side of the workspace mount (named volume or host path).
    fn workspace_volume(&self) -> &str;

    /// Container side of the workspace mount.
    fn mount_alias(&self) -> &str {
        DEFAULT_MOUNT_ALIAS
    }

    /// `-v` argument mounting the workspace into the container.
    fn volume_mount(&self) -> String {
        format!("{}:{}", self.workspace_volume(), self.mount_alias())
    }

    /// Host directory where materialized configs are written. Must be the
    /// same storage the workspace volume exposes at [`Self::mount_alias`].
    fn config_dir(&self) -> &Path;

    /// Stop a running container by name.
    async fn stop_container(&self, name: &str) -> ContainerResult<()>;

    /// Build an operator-facing message from everything a failed run produced.
    fn build_diagnostic_message(
        &self,
        prefix: &str,
        output: &str,
        err_output: &str,
        err: &dyn std::error::Error,
    ) -> String {
        let mut msg = prefix.to_string();
        if !output.trim().is_empty() {
            msg.push_str("\n\t[stdout]: ");
            msg.push_str(output.trim_end());
        }
        if !err_output.trim().is_empty() {
            msg.push_str("\n\t[stderr]: ");
            msg.push_str(err_output.trim_end());
        }
        msg.push_str("\n\t");
        msg.push_str(&err.to_string());
        msg
    }
}

/// Container runtime client backed by the docker or podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    image_prefix: String,
    workspace_volume: String,
    mount_alias: String,
    config_dir: PathBuf,
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first, then falls back to Podman.
    pub fn new(workspace_volume: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fall back to docker, will fail at runtime
            RuntimeType::Docker
        };
        Self::with_type(runtime_type, workspace_volume, config_dir)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(
        runtime_type: RuntimeType,
        workspace_volume: impl Into<String>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            workspace_volume: workspace_volume.into(),
            mount_alias: DEFAULT_MOUNT_ALIAS.to_string(),
            config_dir: config_dir.into(),
        }
    }

    /// Use a custom binary path.
    pub fn binary_path(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Set the image namespace prepended to bare connector names.
    pub fn image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    /// Set the container-side mount point of the workspace volume.
    pub fn mount_at(mut self, alias: impl Into<String>) -> Self {
        self.mount_alias = alias.into();
        self
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect`, which works for both Docker and Podman.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;

        Ok(output.status.success())
    }

    /// Stop a running container.
    pub async fn stop(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        let output = Command::new(&self.binary)
            .args(["stop", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ImageRuntime for ContainerRuntime {
    fn binary(&self) -> &str {
        &self.binary
    }

    async fn is_pulled(&self, image: &str, version: &str) -> bool {
        let reference = format!("{}:{}", image, version);
        match self.image_exists(&reference).await {
            Ok(exists) => {
                debug!("image {} present locally: {}", reference, exists);
                exists
            }
            Err(e) => {
                warn!("Failed to inspect image {}: {}", reference, e);
                false
            }
        }
    }

    fn qualify(&self, image: &str) -> String {
        if self.image_prefix.is_empty() || image.starts_with(&self.image_prefix) {
            image.to_string()
        } else {
            format!("{}{}", self.image_prefix, image)
        }
    }

    fn workspace_volume(&self) -> &str {
        &self.workspace_volume
    }

    fn mount_alias(&self) -> &str {
        &self.mount_alias
    }

    fn volume_mount(&self) -> String {
        if self.runtime_type.needs_selinux_labels() {
            format!("{}:{}:Z", self.workspace_volume, self.mount_alias)
        } else {
            format!("{}:{}", self.workspace_volume, self.mount_alias)
        }
    }

    fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    async fn stop_container(&self, name: &str) -> ContainerResult<()> {
        self.stop(name).await
    }
}
