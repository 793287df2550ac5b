//! Lifecycle notifications for rules, jobs, and command execution.
//!
//! The engine emits `BuildEvent`s at well-defined points (rule declared,
//! dependency added, command spawned, ...) so that front ends can render
//! progress or verbosity output. Events are pure notifications: the
//! engine's correctness never depends on a listener being present.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Which output stream of a command an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  Stdout,
  Stderr,
  Combined,
}

impl std::fmt::Display for StreamKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StreamKind::Stdout => write!(f, "stdout"),
      StreamKind::Stderr => write!(f, "stderr"),
      StreamKind::Combined => write!(f, "combined"),
    }
  }
}

/// A lifecycle notification emitted by the engine.
///
/// `rule` is always the emitting rule's label.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
  /// A rule was added to the graph.
  RuleDeclared { rule: String },

  /// A job started binding its dependencies and outputs.
  RuleDefining { rule: String },

  /// A job finished (up to date or executed).
  RuleDefined { rule: String },

  /// A dependency was bound to a job (declared or discovered).
  DependencyAdded { rule: String, artifact: String },

  /// An output was bound to a job (declared or discovered).
  OutputAdded { rule: String, artifact: String },

  /// A job is about to invoke its recipe.
  RecipeInvoked { rule: String },

  /// A command is about to be spawned.
  CommandSpawning { rule: String, command: String },

  /// A command process started.
  CommandSpawned { rule: String, pid: Option<u32> },

  /// A command process finished.
  CommandCompleted { rule: String, code: Option<i32> },

  /// A command stream finished being captured into a sink.
  OutputCaptured {
    rule: String,
    stream: StreamKind,
    artifact: Option<String>,
  },
}

/// Receives engine events.
///
/// Implementations must be cheap and non-blocking; they run inline on the
/// emitting job's task.
pub trait EventSink: Send + Sync {
  fn event(&self, event: &BuildEvent);
}

/// Fans events out to zero or more sinks.
#[derive(Clone, Default)]
pub struct EventBus {
  sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a sink. Sinks are invoked in subscription order.
  pub fn subscribe(&mut self, sink: Arc<dyn EventSink>) {
    self.sinks.push(sink);
  }

  pub fn emit(&self, event: BuildEvent) {
    for sink in &self.sinks {
      sink.event(&event);
    }
  }
}

impl std::fmt::Debug for EventBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventBus").field("sinks", &self.sinks.len()).finish()
  }
}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
  fn event(&self, event: &BuildEvent) {
    debug!(event = ?event, "build event");
  }
}

/// Records every event in memory. Useful for tests and TUI front ends
/// that render after the fact.
#[derive(Default)]
pub struct CollectingSink {
  events: Mutex<Vec<BuildEvent>>,
}

impl CollectingSink {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn events(&self) -> Vec<BuildEvent> {
    self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  /// Count events matching a predicate.
  pub fn count_where(&self, predicate: impl Fn(&BuildEvent) -> bool) -> usize {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|e| predicate(e))
      .count()
  }
}

impl EventSink for CollectingSink {
  fn event(&self, event: &BuildEvent) {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(event.clone());
  }
}
