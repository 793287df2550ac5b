//! File-backed artifacts.
//!
//! The version of a file artifact is a content fingerprint: the SHA-256
//! of the file's bytes, or a deterministic tree hash when the path is a
//! directory. Timestamps never participate, so touching a file without
//! changing it does not invalidate anything.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::consts::DEFAULT_ARTIFACT_KIND;
use crate::util::hash::{hash_directory, hash_file};

use super::{Artifact, ArtifactError, ArtifactKey, Descriptor, Version};

pub struct FileArtifact {
  identity: String,
  key: ArtifactKey,
  path: PathBuf,
}

impl FileArtifact {
  /// Create a file artifact. `identity` is the workspace-relative path
  /// (forward slashes); `path` is where it actually lives.
  pub fn new(identity: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
    let identity = identity.into();
    let key = Descriptor::new(DEFAULT_ARTIFACT_KIND, &identity).key()?;
    Ok(Self {
      identity,
      key,
      path: path.into(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn io_error(&self, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
      identity: self.identity.clone(),
      source,
    }
  }
}

#[async_trait]
impl Artifact for FileArtifact {
  fn kind(&self) -> &str {
    DEFAULT_ARTIFACT_KIND
  }

  fn identity(&self) -> &str {
    &self.identity
  }

  fn key(&self) -> &ArtifactKey {
    &self.key
  }

  async fn version(&self) -> Result<Version, ArtifactError> {
    let metadata = match tokio::fs::metadata(&self.path).await {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Version::nonexistent()),
      Err(e) => return Err(self.io_error(e)),
    };

    // Hashing is blocking work; keep it off the scheduler threads.
    let path = self.path.clone();
    let identity = self.identity.clone();
    let is_dir = metadata.is_dir();
    let fingerprint = tokio::task::spawn_blocking(move || {
      if is_dir {
        hash_directory(&path, &[])
      } else {
        hash_file(&path)
      }
    })
    .await
    .map_err(|e| ArtifactError::Fingerprint {
      identity: identity.clone(),
      message: e.to_string(),
    })?
    .map_err(|e| ArtifactError::Fingerprint {
      identity,
      message: e.to_string(),
    })?;

    Ok(Version::new(fingerprint.0))
  }

  async fn rm(&self) -> Result<(), ArtifactError> {
    let result = match tokio::fs::metadata(&self.path).await {
      Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&self.path).await,
      Ok(_) => tokio::fs::remove_file(&self.path).await,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(self.io_error(e)),
    };

    match result {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(self.io_error(e)),
    }
  }

  fn external_path(&self) -> Option<&Path> {
    Some(&self.path)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[tokio::test]
  async fn missing_file_has_nonexistent_version() {
    let temp = tempdir().unwrap();
    let artifact = FileArtifact::new("gone.txt", temp.path().join("gone.txt")).unwrap();

    assert!(artifact.version().await.unwrap().is_nonexistent());
    assert!(!artifact.exists().await.unwrap());
  }

  #[tokio::test]
  async fn version_tracks_content_not_mtime() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("data.txt");
    tokio::fs::write(&path, "alpha").await.unwrap();

    let artifact = FileArtifact::new("data.txt", &path).unwrap();
    let v1 = artifact.version().await.unwrap();

    // Rewrite with identical bytes: version must not change.
    tokio::fs::write(&path, "alpha").await.unwrap();
    assert_eq!(artifact.version().await.unwrap(), v1);

    tokio::fs::write(&path, "beta").await.unwrap();
    assert_ne!(artifact.version().await.unwrap(), v1);
  }

  #[tokio::test]
  async fn directory_artifacts_fingerprint_their_tree() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("bundle");
    tokio::fs::create_dir(&dir).await.unwrap();
    tokio::fs::write(dir.join("a.txt"), "a").await.unwrap();

    let artifact = FileArtifact::new("bundle", &dir).unwrap();
    let v1 = artifact.version().await.unwrap();

    tokio::fs::write(dir.join("b.txt"), "b").await.unwrap();
    assert_ne!(artifact.version().await.unwrap(), v1);
  }

  #[tokio::test]
  async fn rm_is_idempotent() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("scratch.txt");
    tokio::fs::write(&path, "x").await.unwrap();

    let artifact = FileArtifact::new("scratch.txt", &path).unwrap();
    artifact.rm().await.unwrap();
    assert!(!artifact.exists().await.unwrap());
    artifact.rm().await.unwrap();
  }
}
