//! Rules: named build steps with declared outputs and dependencies.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactKey};
use crate::recipe::Recipe;
use crate::util::hash::{HashError, ObjectHash, object_hash_of};

/// Stable identifier of a rule: the truncated hash of its identity string.
pub type RuleKey = ObjectHash;

/// What it means for a dependency to be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsencePolicy {
  /// The dependency must exist once its producer has run; absence fails
  /// the consuming job.
  Violation,

  /// Absence is itself a valid, recordable state; the nonexistent
  /// sentinel becomes the recorded version.
  State,
}

/// A typed edge from a rule to an artifact it consumes.
#[derive(Clone)]
pub struct Dependency {
  pub artifact: Arc<dyn Artifact>,
  pub when_absent: AbsencePolicy,
}

impl Dependency {
  /// A dependency that must exist after its producer ran.
  pub fn required(artifact: Arc<dyn Artifact>) -> Self {
    Self {
      artifact,
      when_absent: AbsencePolicy::Violation,
    }
  }

  /// A dependency whose absence is a recordable state.
  pub fn stateful(artifact: Arc<dyn Artifact>) -> Self {
    Self {
      artifact,
      when_absent: AbsencePolicy::State,
    }
  }

  pub fn key(&self) -> &ArtifactKey {
    self.artifact.key()
  }
}

impl std::fmt::Debug for Dependency {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dependency")
      .field("artifact", &self.artifact.identity())
      .field("when_absent", &self.when_absent)
      .finish()
  }
}

/// A named build step.
///
/// A rule's identity is either explicit or a sequence number assigned on
/// first graph insertion; its key is the hash of that identity and must
/// be unique within a graph.
pub struct Rule {
  identity: String,
  key: RuleKey,
  module: String,
  name: String,
  label: String,
  outputs: BTreeMap<ArtifactKey, Arc<dyn Artifact>>,
  dependencies: BTreeMap<ArtifactKey, Dependency>,
  also: BTreeMap<RuleKey, Arc<Rule>>,
  after: BTreeMap<RuleKey, Arc<Rule>>,
  always: bool,
  recipe: Option<Arc<dyn Recipe>>,
}

impl Rule {
  pub fn builder(name: impl Into<String>) -> RuleBuilder {
    RuleBuilder::new(name)
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  pub fn key(&self) -> &RuleKey {
    &self.key
  }

  pub fn module(&self) -> &str {
    &self.module
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn outputs(&self) -> &BTreeMap<ArtifactKey, Arc<dyn Artifact>> {
    &self.outputs
  }

  pub fn dependencies(&self) -> &BTreeMap<ArtifactKey, Dependency> {
    &self.dependencies
  }

  /// Co-required rules, unordered relative to this one.
  pub fn also(&self) -> &BTreeMap<RuleKey, Arc<Rule>> {
    &self.also
  }

  /// Ordering-only predecessors: no data edge, but their jobs finish
  /// before this rule's recipe runs.
  pub fn after(&self) -> &BTreeMap<RuleKey, Arc<Rule>> {
    &self.after
  }

  pub fn always(&self) -> bool {
    self.always
  }

  pub fn recipe(&self) -> Option<&Arc<dyn Recipe>> {
    self.recipe.as_ref()
  }

  /// A synthetic source rule: no recipe, always defers to on-disk state.
  pub fn is_source(&self) -> bool {
    self.recipe.is_none()
  }
}

impl std::fmt::Debug for Rule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Rule")
      .field("identity", &self.identity)
      .field("label", &self.label)
      .field("module", &self.module)
      .field("outputs", &self.outputs.len())
      .field("dependencies", &self.dependencies.len())
      .field("always", &self.always)
      .finish()
  }
}

/// Accumulates a rule definition before graph insertion.
pub struct RuleBuilder {
  identity: Option<String>,
  module: String,
  name: String,
  label: Option<String>,
  outputs: Vec<Arc<dyn Artifact>>,
  dependencies: Vec<Dependency>,
  also: Vec<Arc<Rule>>,
  after: Vec<Arc<Rule>>,
  always: bool,
  recipe: Option<Arc<dyn Recipe>>,
}

impl RuleBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      identity: None,
      module: String::new(),
      name: name.into(),
      label: None,
      outputs: Vec::new(),
      dependencies: Vec::new(),
      also: Vec::new(),
      after: Vec::new(),
      always: false,
      recipe: None,
    }
  }

  /// Explicit identity. Without one, the graph assigns a sequence number.
  pub fn identity(mut self, identity: impl Into<String>) -> Self {
    self.identity = Some(identity.into());
    self
  }

  pub fn module(mut self, module: impl Into<String>) -> Self {
    self.module = module.into();
    self
  }

  pub fn label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn output(mut self, artifact: Arc<dyn Artifact>) -> Self {
    self.outputs.push(artifact);
    self
  }

  pub fn dependency(mut self, dependency: Dependency) -> Self {
    self.dependencies.push(dependency);
    self
  }

  /// Shorthand for a `Violation`-policy dependency.
  pub fn depends_on(self, artifact: Arc<dyn Artifact>) -> Self {
    self.dependency(Dependency::required(artifact))
  }

  /// Co-required rule (must already be in the graph).
  pub fn also(mut self, rule: &Arc<Rule>) -> Self {
    self.also.push(rule.clone());
    self
  }

  /// Ordering-only predecessor (must already be in the graph).
  pub fn after(mut self, rule: &Arc<Rule>) -> Self {
    self.after.push(rule.clone());
    self
  }

  /// Mark the rule permanently stale: its recipe runs on every build.
  pub fn always(mut self) -> Self {
    self.always = true;
    self
  }

  pub fn recipe(mut self, recipe: Arc<dyn Recipe>) -> Self {
    self.recipe = Some(recipe);
    self
  }

  pub(crate) fn explicit_identity(&self) -> Option<&str> {
    self.identity.as_deref()
  }

  /// Finalize with a resolved identity. Called by `Graph::add_rule`.
  pub(crate) fn build(self, identity: String) -> Result<Rule, HashError> {
    let key = object_hash_of(&identity)?;
    let label = self.label.unwrap_or_else(|| self.name.clone());

    let outputs = self
      .outputs
      .into_iter()
      .map(|artifact| (artifact.key().clone(), artifact))
      .collect();
    let dependencies = self
      .dependencies
      .into_iter()
      .map(|dependency| (dependency.key().clone(), dependency))
      .collect();
    let also = self
      .also
      .into_iter()
      .map(|rule| (rule.key().clone(), rule))
      .collect();
    let after = self
      .after
      .into_iter()
      .map(|rule| (rule.key().clone(), rule))
      .collect();

    Ok(Rule {
      identity,
      key,
      module: self.module,
      name: self.name,
      label,
      outputs,
      dependencies,
      also,
      after,
      always: self.always,
      recipe: self.recipe,
    })
  }
}
