//! The per-job recipe pseudo-artifact.
//!
//! Every job with a recipe gets a synthetic dependency on this artifact,
//! whose version is the hash of the job's concretized recipe spec. A
//! changed command line or recipe configuration therefore invalidates the
//! rule's outputs exactly like a changed input file would.

use async_trait::async_trait;

use crate::consts::RECIPE_ARTIFACT_KIND;
use crate::util::hash::ObjectHash;

use super::{Artifact, ArtifactError, ArtifactKey, Descriptor, Version};

pub struct RecipeArtifact {
  identity: String,
  key: ArtifactKey,
  version: Version,
}

impl RecipeArtifact {
  /// `rule_identity` keeps the key stable across runs; `spec_hash` is the
  /// hash of this run's concretized spec and becomes the version.
  pub fn new(rule_identity: &str, spec_hash: ObjectHash) -> Result<Self, ArtifactError> {
    let identity = rule_identity.to_string();
    let key = Descriptor::new(RECIPE_ARTIFACT_KIND, &identity).key()?;
    Ok(Self {
      identity,
      key,
      version: Version::new(spec_hash.0),
    })
  }
}

#[async_trait]
impl Artifact for RecipeArtifact {
  fn kind(&self) -> &str {
    RECIPE_ARTIFACT_KIND
  }

  fn identity(&self) -> &str {
    &self.identity
  }

  fn key(&self) -> &ArtifactKey {
    &self.key
  }

  async fn version(&self) -> Result<Version, ArtifactError> {
    Ok(self.version.clone())
  }

  async fn exists(&self) -> Result<bool, ArtifactError> {
    Ok(true)
  }

  async fn rm(&self) -> Result<(), ArtifactError> {
    // Nothing durable to remove; the spec lives in the rule definition.
    Ok(())
  }
}
