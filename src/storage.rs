//! Artifact storage.
//!
//! Two locations with different lifetimes:
//! - the staging directory holds request-scoped uploads, removed on every exit path
//! - the artifact directory holds annotated images that outlive the request
//!
//! Artifact names are `<uuid>.<ext>`, so concurrent requests never collide and no
//! locking is needed.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_STAGING_DIR: &str = "temp";
pub const DEFAULT_ARTIFACT_DIR: &str = "log";

const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg"];

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    staging_dir: PathBuf,
    artifact_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(staging_dir: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Result<Self> {
        let staging_dir = staging_dir.into();
        let artifact_dir = artifact_dir.into();
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("create staging dir {}", staging_dir.display()))?;
        fs::create_dir_all(&artifact_dir)
            .with_context(|| format!("create artifact dir {}", artifact_dir.display()))?;
        Ok(Self {
            staging_dir,
            artifact_dir,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Write an upload to scoped temporary storage.
    ///
    /// The returned guard deletes the file when released or dropped.
    pub fn stage(&self, id: &str, ext: &str, bytes: &[u8]) -> Result<StagedUpload> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", id))
            .suffix(&format!(".{}", ext))
            .tempfile_in(&self.staging_dir)
            .with_context(|| format!("create staging file in {}", self.staging_dir.display()))?;
        file.write_all(bytes).context("write staged upload")?;
        file.as_file().sync_all().context("sync staged upload")?;
        log::debug!("staged upload {} ({} bytes)", file.path().display(), bytes.len());
        Ok(StagedUpload { file: Some(file) })
    }

    /// Durably store an annotated image as `<id>.<ext>` and return the file name.
    pub fn persist_artifact(&self, id: &str, ext: &str, bytes: &[u8]) -> Result<String> {
        let name = format!("{}.{}", id, ext);
        let path = self.artifact_path(&name)?;
        if path.exists() {
            return Err(anyhow!("artifact {} already exists", name));
        }
        write_atomic(&path, bytes)?;
        Ok(name)
    }

    /// Best-effort removal of a persisted artifact.
    pub fn remove_artifact(&self, name: &str) -> Result<()> {
        let path = self.artifact_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove artifact {}", path.display())),
        }
    }

    pub fn read_artifact(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.artifact_path(name)?;
        fs::read(&path).with_context(|| format!("read artifact {}", path.display()))
    }

    /// Resolve an artifact name inside the artifact directory.
    pub fn artifact_path(&self, name: &str) -> Result<PathBuf> {
        let sanitized = sanitize_artifact_name(name)?;
        Ok(self.artifact_dir.join(sanitized))
    }
}

/// Request-scoped staged upload.
#[derive(Debug)]
pub struct StagedUpload {
    file: Option<NamedTempFile>,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        self.file
            .as_ref()
            .map(|f| f.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Delete the staged file now, reporting any failure. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            file.close()
                .with_context(|| format!("remove staged upload {}", path.display()))?;
            log::debug!("released staged upload {}", path.display());
        }
        Ok(())
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("staged upload cleanup failed: {:#}", err);
        }
    }
}

/// Names are `[a-z0-9-]+.(png|jpg)`; anything else never touches the filesystem.
pub fn sanitize_artifact_name(name: &str) -> Result<&str> {
    let (stem, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("artifact name has no extension"))?;
    if stem.is_empty()
        || !stem
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(anyhow!("artifact name must be lowercase [a-z0-9-] only"));
    }
    if !ARTIFACT_EXTENSIONS.contains(&ext) {
        return Err(anyhow!("artifact extension '{}' not allowed", ext));
    }
    Ok(name)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
