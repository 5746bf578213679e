//! Ephemeral configuration files for connector containers.
//!
//! The connector only ever sees files, so every configuration object is
//! written to its own uniquely named directory under the runtime's config
//! dir. That directory is visible inside the container through the
//! workspace mount. The returned [`ConfigArtifact`] removes the directory
//! again when dropped.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors writing a configuration artifact.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("failed to create config directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize connector config: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A configuration file written for a single invocation.
///
/// The directory and everything in it are deleted when the artifact is
/// dropped, on success, failure and unwinding alike.
#[derive(Debug)]
pub struct ConfigArtifact {
    dir: PathBuf,
    file: PathBuf,
    relative: String,
}

impl ConfigArtifact {
    /// Host path of the per-invocation directory.
    pub fn absolute_dir(&self) -> &Path {
        &self.dir
    }

    /// Host path of the config file.
    pub fn absolute_file(&self) -> &Path {
        &self.file
    }

    /// `<dir>/<file>` relative to the config root.
    pub fn relative_path(&self) -> &str {
        &self.relative
    }

    /// Where the container sees the file, given the workspace mount alias.
    pub fn mounted_path(&self, mount_alias: &str) -> String {
        format!("{}/{}", mount_alias.trim_end_matches('/'), self.relative)
    }
}

impl Drop for ConfigArtifact {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("removed config artifact {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove config artifact {}: {}",
                self.dir.display(),
                e
            ),
        }
    }
}

/// Serialize `config` into a fresh directory under `config_dir`.
pub fn materialize<T: Serialize + ?Sized>(
    config_dir: &Path,
    config: &T,
) -> Result<ConfigArtifact, MaterializeError> {
    // Serialize before touching the filesystem so a bad config leaves nothing behind.
    let body = serde_json::to_vec_pretty(config)?;

    let dir_name = Uuid::new_v4().simple().to_string();
    let file_name = format!("{}.json", Uuid::new_v4().simple());
    let dir = config_dir.join(&dir_name);

    std::fs::create_dir_all(&dir).map_err(|source| MaterializeError::DirectoryCreation {
        path: dir.clone(),
        source,
    })?;

    let artifact = ConfigArtifact {
        file: dir.join(&file_name),
        relative: format!("{}/{}", dir_name, file_name),
        dir,
    };

    std::fs::write(&artifact.file, body).map_err(|source| MaterializeError::Write {
        path: artifact.file.clone(),
        source,
    })?;

    Ok(artifact)
}
