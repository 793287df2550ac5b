//! Recipes: the pluggable "how" of a rule.
//!
//! A recipe is used in two phases. `concretize` resolves every symbolic
//! reference in the recipe body against the job's rule and module context
//! and produces a `RecipeSpec` — a pure description with a stable content
//! hash. The same recipe definition is routinely shared by many rules,
//! so everything contextual must flow through concretization rather than
//! construction. `execute` then performs the side effect for one job.
//!
//! The spec hash doubles as the version of the job's recipe
//! pseudo-artifact: a changed command line or configuration invalidates
//! outputs exactly like a changed input file.

pub mod command;
pub mod delayed;
pub mod template;
pub mod wrapper;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::artifact::{ArtifactError, ArtifactManager, ArtifactRef, ManagerError};
use crate::graph::Rule;
use crate::util::hash::{ObjectHash, object_hash_of};

pub use command::{CommandPlan, CommandRecipe, CommandSpec, OutputSink, SinkSpec};
pub use delayed::DelayedRecipe;
pub use template::{Segment, TemplateError};
pub use wrapper::{AroundHook, Hook, Proceed, WrapperRecipe};

/// Errors raised by recipe concretization or execution.
#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("rule `{rule}`: command `{command}` exited with code {code}")]
  CommandFailed { rule: String, command: String, code: i32 },

  #[error("rule `{rule}`: command `{command}` terminated by signal {signal}")]
  CommandSignaled { rule: String, command: String, signal: i32 },

  #[error("io error running `{command}`: {source}")]
  Io {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("recipe declares no command to execute")]
  EmptyCommand,

  #[error("sink artifact `{0}` has no writable filesystem path")]
  SinkNotWritable(String),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Manager(#[from] ManagerError),

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error("recipe spec serialization failed: {0}")]
  Spec(#[from] serde_json::Error),
}

/// A concretized recipe: what would run, with every symbolic reference
/// resolved, but no side effects performed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSpec {
  /// Discriminates the executing recipe implementation (`command`, ...).
  pub kind: String,

  /// The full structured spec, canonical enough to hash.
  pub payload: Value,

  /// Human-readable description for diagnostics and verbose output.
  pub description: String,
}

#[derive(Serialize)]
struct SpecDigest<'a> {
  kind: &'a str,
  payload: &'a Value,
}

impl RecipeSpec {
  pub fn new(kind: impl Into<String>, payload: Value, description: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      payload,
      description: description.into(),
    }
  }

  /// Stable content hash of the spec, independent of job identity.
  pub fn spec_hash(&self) -> Result<ObjectHash, serde_json::Error> {
    object_hash_of(&SpecDigest {
      kind: &self.kind,
      payload: &self.payload,
    })
  }

  /// Debug-readable description of the concretized spec.
  pub fn describe(&self) -> &str {
    &self.description
  }
}

/// The contextual bindings a recipe concretizes against.
pub struct RecipeContext<'a> {
  pub rule: &'a Arc<Rule>,
  pub manager: &'a Arc<ArtifactManager>,
}

impl<'a> RecipeContext<'a> {
  pub fn new(rule: &'a Arc<Rule>, manager: &'a Arc<ArtifactManager>) -> Self {
    Self { rule, manager }
  }

  pub fn module(&self) -> &str {
    self.rule.module()
  }

  /// Resolve an artifact reference to its external identifier, defaulting
  /// the module to this rule's.
  pub fn resolve_external(&self, reference: impl Into<ArtifactRef>) -> Result<String, RecipeError> {
    Ok(
      self
        .manager
        .resolve_to_external_identifier(reference, Some(self.rule.module()))?,
    )
  }
}

/// A pluggable build step implementation.
#[async_trait]
pub trait Recipe: Send + Sync {
  /// Resolve the recipe body into a concrete, hashable spec for one job.
  /// Must be pure with respect to external side effects.
  fn concretize(&self, ctx: &RecipeContext<'_>) -> Result<RecipeSpec, RecipeError>;

  /// Perform the side effect described by `spec` for `job`.
  async fn execute(
    &self,
    job: &Arc<crate::job::Job>,
    build: &Arc<crate::build::Build>,
    spec: &RecipeSpec,
  ) -> Result<(), RecipeError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn spec_hash_ignores_description() {
    let a = RecipeSpec::new("command", json!({"exec": "cc", "args": ["-c"]}), "compile main.c");
    let b = RecipeSpec::new("command", json!({"exec": "cc", "args": ["-c"]}), "compile other.c");
    let c = RecipeSpec::new("command", json!({"exec": "cc", "args": ["-O2"]}), "compile main.c");

    assert_eq!(a.spec_hash().unwrap(), b.spec_hash().unwrap());
    assert_ne!(a.spec_hash().unwrap(), c.spec_hash().unwrap());
  }

  #[test]
  fn spec_hash_depends_on_kind() {
    let a = RecipeSpec::new("command", json!({"x": 1}), "");
    let b = RecipeSpec::new("delayed", json!({"x": 1}), "");
    assert_ne!(a.spec_hash().unwrap(), b.spec_hash().unwrap());
  }
}
