//! The static build topology.
//!
//! A `Graph` indexes rules by key and by produced-artifact key. It is
//! constructed once, ahead of a run, by the declarative front end; the
//! scheduler only reads it. At most one rule may produce any given
//! artifact key — a second producer is graph corruption and fails
//! loudly rather than silently overwriting.

pub mod rule;

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::artifact::{Artifact, ArtifactKey};
use crate::events::{BuildEvent, EventBus};
use crate::util::hash::HashError;

pub use rule::{AbsencePolicy, Dependency, Rule, RuleBuilder, RuleKey};

/// Errors indicating a corrupt or inconsistent graph.
#[derive(Debug, Error)]
pub enum GraphError {
  /// Two rules claim the same output artifact.
  #[error("output `{artifact}` is produced by both rule `{existing}` and rule `{adding}`")]
  OutputConflict {
    artifact: String,
    existing: String,
    adding: String,
  },

  /// The dependency/`after` edges contain a cycle.
  #[error("dependency cycle detected in rule graph")]
  Cycle,

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Rule and output indexes over the static topology.
pub struct Graph {
  rules: HashMap<RuleKey, Arc<Rule>>,
  output_owner: HashMap<ArtifactKey, RuleKey>,
  next_identity: u64,
  events: EventBus,
}

impl Default for Graph {
  fn default() -> Self {
    Self::new()
  }
}

impl Graph {
  pub fn new() -> Self {
    Self::with_events(EventBus::new())
  }

  pub fn with_events(events: EventBus) -> Self {
    Self {
      rules: HashMap::new(),
      output_owner: HashMap::new(),
      next_identity: 0,
      events,
    }
  }

  /// Add a rule, assigning a sequential identity if it has none.
  ///
  /// Re-adding an already-present key is a no-op returning the existing
  /// rule. Indexing a second producer for an owned output fails.
  pub fn add_rule(&mut self, builder: RuleBuilder) -> Result<Arc<Rule>, GraphError> {
    let identity = match builder.explicit_identity() {
      Some(identity) => identity.to_string(),
      None => {
        self.next_identity += 1;
        self.next_identity.to_string()
      }
    };

    let rule = builder.build(identity)?;
    if let Some(existing) = self.rules.get(rule.key()) {
      return Ok(existing.clone());
    }

    let rule = Arc::new(rule);
    self.index_rule(&rule)?;
    self.rules.insert(rule.key().clone(), rule.clone());

    debug!(rule = %rule.label(), key = %rule.key(), "rule added");
    self.events.emit(BuildEvent::RuleDeclared {
      rule: rule.label().to_string(),
    });

    Ok(rule)
  }

  /// Register the rule's declared outputs in the output → rule index.
  fn index_rule(&mut self, rule: &Arc<Rule>) -> Result<(), GraphError> {
    for (artifact_key, artifact) in rule.outputs() {
      if let Some(owner_key) = self.output_owner.get(artifact_key)
        && owner_key != rule.key()
      {
        let existing = self
          .rules
          .get(owner_key)
          .map(|owner| owner.label().to_string())
          .unwrap_or_else(|| owner_key.to_string());
        return Err(GraphError::OutputConflict {
          artifact: artifact.identity().to_string(),
          existing,
          adding: rule.label().to_string(),
        });
      }
    }
    for artifact_key in rule.outputs().keys() {
      self.output_owner.insert(artifact_key.clone(), rule.key().clone());
    }
    Ok(())
  }

  pub fn get_rule(&self, key: &RuleKey) -> Option<Arc<Rule>> {
    self.rules.get(key).cloned()
  }

  /// The rule producing an artifact, or `None` for a pure source.
  pub fn get_rule_for(&self, artifact: &dyn Artifact) -> Option<Arc<Rule>> {
    self.get_rule_for_key(artifact.key())
  }

  pub fn get_rule_for_key(&self, artifact_key: &ArtifactKey) -> Option<Arc<Rule>> {
    self
      .output_owner
      .get(artifact_key)
      .and_then(|rule_key| self.rules.get(rule_key))
      .cloned()
  }

  pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
    self.rules.values()
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Verify the dependency and `after` edges form a DAG.
  pub fn verify_acyclic(&self) -> Result<(), GraphError> {
    let mut graph: DiGraph<RuleKey, ()> = DiGraph::new();
    let mut nodes: HashMap<RuleKey, NodeIndex> = HashMap::new();

    for key in self.rules.keys() {
      let idx = graph.add_node(key.clone());
      nodes.insert(key.clone(), idx);
    }

    for (key, rule) in &self.rules {
      let dependent = nodes[key];

      for dependency in rule.dependencies().values() {
        if let Some(owner) = self.output_owner.get(dependency.key())
          && let Some(&producer) = nodes.get(owner)
          && producer != dependent
        {
          graph.add_edge(producer, dependent, ());
        }
      }

      for after_key in rule.after().keys() {
        if let Some(&predecessor) = nodes.get(after_key) {
          graph.add_edge(predecessor, dependent, ());
        }
      }
    }

    toposort(&graph, None).map_err(|_| GraphError::Cycle)?;
    Ok(())
  }
}

impl std::fmt::Debug for Graph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Graph")
      .field("rules", &self.rules.len())
      .field("outputs", &self.output_owner.len())
      .finish()
  }
}
