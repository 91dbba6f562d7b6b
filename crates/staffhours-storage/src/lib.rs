//! Staged, atomically committed report bundles for the staff hours report.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "staffhours-storage";

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("report bundle {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("artifact path {0} must be relative and stay inside the bundle")]
    InvalidRelativePath(PathBuf),
    #[error("artifact {0} was already written to this bundle")]
    DuplicateArtifact(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn bundle_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Opens a hidden staging directory that becomes `root/name` on commit.
    pub fn begin_bundle(&self, name: &str) -> anyhow::Result<StagedBundle> {
        let final_dir = self.bundle_path(name);
        if final_dir.exists() {
            return Err(BundleError::AlreadyExists(final_dir).into());
        }
        let staging_dir = self.root.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("creating staging directory {}", staging_dir.display()))?;
        debug!(staging = %staging_dir.display(), bundle = name, "opened staging directory");
        Ok(StagedBundle {
            staging_dir,
            final_dir,
            artifacts: Vec::new(),
            committed: false,
        })
    }

    /// Committed bundle directories, staging directories excluded.
    pub fn list_bundles(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        dirs.sort();
        Ok(dirs)
    }
}

/// Report files written so far; removed on drop unless committed.
#[derive(Debug)]
pub struct StagedBundle {
    staging_dir: PathBuf,
    final_dir: PathBuf,
    artifacts: Vec<StoredArtifact>,
    committed: bool,
}

impl StagedBundle {
    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    pub fn artifacts(&self) -> &[StoredArtifact] {
        &self.artifacts
    }

    pub fn write_file(
        &mut self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative_path.as_ref();
        let stays_inside = relative_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !stays_inside || relative_path.as_os_str().is_empty() {
            return Err(BundleError::InvalidRelativePath(relative_path.to_path_buf()).into());
        }
        if self.artifacts.iter().any(|a| a.relative_path == relative_path) {
            return Err(BundleError::DuplicateArtifact(relative_path.to_path_buf()).into());
        }

        let absolute_path = self.staging_dir.join(relative_path);
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&absolute_path)
            .with_context(|| format!("opening staged artifact {}", absolute_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing staged artifact {}", absolute_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing staged artifact {}", absolute_path.display()))?;

        let artifact = StoredArtifact {
            content_hash: ArtifactStore::sha256_hex(bytes),
            relative_path: relative_path.to_path_buf(),
            byte_size: bytes.len(),
        };
        self.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    /// Publishes every staged file at once by renaming the staging directory.
    pub fn commit(mut self) -> anyhow::Result<PathBuf> {
        if self.final_dir.exists() {
            return Err(BundleError::AlreadyExists(self.final_dir.clone()).into());
        }
        fs::rename(&self.staging_dir, &self.final_dir).with_context(|| {
            format!(
                "renaming staged bundle {} -> {}",
                self.staging_dir.display(),
                self.final_dir.display()
            )
        })?;
        self.committed = true;
        info!(
            bundle = %self.final_dir.display(),
            files = self.artifacts.len(),
            "committed report bundle"
        );
        Ok(self.final_dir.clone())
    }
}

impl Drop for StagedBundle {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.staging_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    staging = %self.staging_dir.display(),
                    error = %err,
                    "failed to remove abandoned staging directory"
                );
            }
        }
    }
}
