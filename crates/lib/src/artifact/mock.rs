//! In-memory mock artifacts for tests and dry wiring.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::consts::MOCK_ARTIFACT_KIND;
use crate::util::hash::hash_bytes;

use super::{Artifact, ArtifactError, ArtifactKey, Descriptor, Version};

pub struct MockArtifact {
  identity: String,
  key: ArtifactKey,
  contents: Mutex<Option<String>>,
}

impl MockArtifact {
  pub fn new(identity: impl Into<String>) -> Result<Self, ArtifactError> {
    let identity = identity.into();
    let key = Descriptor::new(MOCK_ARTIFACT_KIND, &identity).key()?;
    Ok(Self {
      identity,
      key,
      contents: Mutex::new(None),
    })
  }

  pub fn with_contents(identity: impl Into<String>, contents: impl Into<String>) -> Result<Self, ArtifactError> {
    let artifact = Self::new(identity)?;
    artifact.set(contents);
    Ok(artifact)
  }

  pub fn set(&self, contents: impl Into<String>) {
    *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.into());
  }

  pub fn clear(&self) {
    *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }

  pub fn contents(&self) -> Option<String> {
    self.contents.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

#[async_trait]
impl Artifact for MockArtifact {
  fn kind(&self) -> &str {
    MOCK_ARTIFACT_KIND
  }

  fn identity(&self) -> &str {
    &self.identity
  }

  fn key(&self) -> &ArtifactKey {
    &self.key
  }

  async fn version(&self) -> Result<Version, ArtifactError> {
    match self.contents() {
      Some(contents) => Ok(Version::new(hash_bytes(contents.as_bytes()).0)),
      None => Ok(Version::nonexistent()),
    }
  }

  async fn rm(&self) -> Result<(), ArtifactError> {
    self.clear();
    Ok(())
  }
}
