//! List artifacts: an ordered group of member artifacts.
//!
//! The version of a list is the hash of the ordered `identity -> version`
//! map of its members, so both member content changes and membership or
//! order changes invalidate dependents.

use std::sync::Arc;

use async_trait::async_trait;

use crate::consts::LIST_ARTIFACT_KIND;
use crate::util::hash::object_hash_of;

use super::{Artifact, ArtifactError, ArtifactKey, Descriptor, Version};

pub struct ListArtifact {
  identity: String,
  key: ArtifactKey,
  members: Vec<Arc<dyn Artifact>>,
}

impl ListArtifact {
  pub fn new(identity: impl Into<String>, members: Vec<Arc<dyn Artifact>>) -> Result<Self, ArtifactError> {
    let identity = identity.into();
    let key = Descriptor::new(LIST_ARTIFACT_KIND, &identity).key()?;
    Ok(Self { identity, key, members })
  }

  pub fn members(&self) -> &[Arc<dyn Artifact>] {
    &self.members
  }
}

#[async_trait]
impl Artifact for ListArtifact {
  fn kind(&self) -> &str {
    LIST_ARTIFACT_KIND
  }

  fn identity(&self) -> &str {
    &self.identity
  }

  fn key(&self) -> &ArtifactKey {
    &self.key
  }

  async fn version(&self) -> Result<Version, ArtifactError> {
    let mut entries: Vec<(String, String)> = Vec::with_capacity(self.members.len());
    for member in &self.members {
      let version = member.version().await?;
      entries.push((member.identity().to_string(), version.as_str().to_string()));
    }
    Ok(Version::new(object_hash_of(&entries)?.0))
  }

  async fn exists(&self) -> Result<bool, ArtifactError> {
    for member in &self.members {
      if !member.exists().await? {
        return Ok(false);
      }
    }
    Ok(true)
  }

  async fn rm(&self) -> Result<(), ArtifactError> {
    for member in &self.members {
      member.rm().await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::MockArtifact;

  fn mock(identity: &str, contents: &str) -> Arc<MockArtifact> {
    Arc::new(MockArtifact::with_contents(identity, contents).unwrap())
  }

  fn members(mocks: &[&Arc<MockArtifact>]) -> Vec<Arc<dyn Artifact>> {
    mocks.iter().map(|m| (*m).clone() as Arc<dyn Artifact>).collect()
  }

  #[tokio::test]
  async fn version_changes_with_member_content() {
    let a = mock("a", "one");
    let b = mock("b", "two");
    let list = ListArtifact::new("pair", members(&[&a, &b])).unwrap();

    let v1 = list.version().await.unwrap();
    a.set("changed");
    assert_ne!(list.version().await.unwrap(), v1);
  }

  #[tokio::test]
  async fn version_depends_on_member_order() {
    let a = mock("a", "one");
    let b = mock("b", "two");

    let forward = ListArtifact::new("pair", members(&[&a, &b])).unwrap();
    let backward = ListArtifact::new("pair", members(&[&b, &a])).unwrap();

    assert_ne!(
      forward.version().await.unwrap(),
      backward.version().await.unwrap()
    );
  }

  #[tokio::test]
  async fn exists_requires_all_members() {
    let a = mock("a", "one");
    let b = mock("b", "two");
    let list = ListArtifact::new("pair", members(&[&a, &b])).unwrap();

    assert!(list.exists().await.unwrap());
    b.clear();
    assert!(!list.exists().await.unwrap());
  }
}
