//! Artifacts: versioned, buildable-or-source entities.
//!
//! Everything the engine can depend on or produce is an `Artifact`: a
//! file (or directory) on disk, a list of other artifacts, the
//! pseudo-artifact standing in for a job's recipe, or an in-memory mock.
//! An artifact is identified by its `(kind, identity)` descriptor, hashed
//! into a stable `ArtifactKey`, and versioned by an opaque fingerprint
//! string. The sentinel `NONEXISTENT_VERSION` denotes absence.

pub mod aid;
pub mod file;
pub mod list;
pub mod manager;
pub mod mock;
pub mod recipe;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::NONEXISTENT_VERSION;
use crate::util::hash::{HashError, Hashable, ObjectHash};

pub use aid::{Aid, AidError};
pub use file::FileArtifact;
pub use list::ListArtifact;
pub use manager::{
  ArtifactFactory, ArtifactManager, ArtifactRef, ArtifactResolver, FileFactory, ManagerError, MockFactory,
};
pub use mock::MockArtifact;
pub use recipe::RecipeArtifact;

/// Stable, collision-free identifier of an artifact: the truncated hash
/// of its `(kind, identity)` descriptor.
pub type ArtifactKey = ObjectHash;

/// An opaque fingerprint of an artifact's current content or state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
  pub fn new(fingerprint: impl Into<String>) -> Self {
    Self(fingerprint.into())
  }

  /// The sentinel version of an artifact that does not currently exist.
  pub fn nonexistent() -> Self {
    Self(NONEXISTENT_VERSION.to_string())
  }

  pub fn is_nonexistent(&self) -> bool {
    self.0 == NONEXISTENT_VERSION
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Version {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The `(kind, identity)` pair an `ArtifactKey` is derived from.
///
/// Descriptors are persisted in the ledger's artifact directory so keys
/// can be mapped back to something a human can read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
  pub kind: String,
  pub identity: String,
}

impl Hashable for Descriptor {}

impl Descriptor {
  pub fn new(kind: impl Into<String>, identity: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      identity: identity.into(),
    }
  }

  pub fn key(&self) -> Result<ArtifactKey, HashError> {
    self.compute_hash()
  }
}

impl std::fmt::Display for Descriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.kind, self.identity)
  }
}

/// Errors raised by artifact operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error("io error on `{identity}`: {source}")]
  Io {
    identity: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to fingerprint `{identity}`: {message}")]
  Fingerprint { identity: String, message: String },

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// A versioned, buildable-or-source entity.
///
/// `version()` is async because fingerprinting may touch the filesystem.
/// Implementations must be cheap to clone behind an `Arc` and safe to
/// share across concurrently running jobs.
#[async_trait]
pub trait Artifact: Send + Sync {
  /// The artifact's type tag (`file`, `list`, `recipe`, `mock`, ...).
  fn kind(&self) -> &str;

  /// Opaque identity, meaningful within the artifact's type
  /// (e.g. a workspace-relative path for files).
  fn identity(&self) -> &str;

  /// Stable key: hash of `(kind, identity)`.
  fn key(&self) -> &ArtifactKey;

  fn descriptor(&self) -> Descriptor {
    Descriptor::new(self.kind(), self.identity())
  }

  /// The artifact's current fingerprint, or the nonexistent sentinel.
  async fn version(&self) -> Result<Version, ArtifactError>;

  async fn exists(&self) -> Result<bool, ArtifactError> {
    Ok(!self.version().await?.is_nonexistent())
  }

  /// Remove the artifact's backing state. Idempotent.
  async fn rm(&self) -> Result<(), ArtifactError>;

  /// Filesystem location, for artifacts that have one.
  fn external_path(&self) -> Option<&Path> {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nonexistent_version_round_trips() {
    let v = Version::nonexistent();
    assert!(v.is_nonexistent());
    assert!(!Version::new("abc").is_nonexistent());
  }

  #[test]
  fn descriptor_key_depends_on_kind_and_identity() {
    let a = Descriptor::new("file", "src/main.c").key().unwrap();
    let b = Descriptor::new("file", "src/main.c").key().unwrap();
    let c = Descriptor::new("mock", "src/main.c").key().unwrap();
    let d = Descriptor::new("file", "src/other.c").key().unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_ne!(a, d);
  }
}
