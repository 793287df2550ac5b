//! The durable version ledger.
//!
//! Each row is a 5-tuple: "when `rule` produced `target` at
//! `target_version`, `source` was at `source_version`". One
//! target+version has many source rows — its full recorded
//! dependency-version set, including the recipe pseudo-artifact. Rows
//! are retracted and rewritten wholesale per target each time that
//! target's rule runs.
//!
//! An artifact directory maps keys back to `(kind, identity)`
//! descriptors for reverse lookup in diagnostics.
//!
//! All reads and writes are measured (`query_count`, `query_time`).
//! The ledger tolerates concurrent readers; per-target writes are
//! serialized by the scheduler, not here.

mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::artifact::{ArtifactKey, Descriptor, Version};
use crate::graph::RuleKey;

use store::LedgerFile;

/// One recorded dependency observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRow {
  pub target: ArtifactKey,
  pub target_version: Version,
  pub rule: RuleKey,
  pub source: ArtifactKey,
  pub source_version: Version,
}

/// A `(source, version)` pair from a recorded row-set.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceVersion {
  pub source: ArtifactKey,
  pub version: Version,
}

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum DbError {
  #[error("failed to read ledger {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write ledger {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse ledger {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize ledger: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported ledger format version {0}")]
  UnsupportedVersion(u32),
}

#[derive(Debug, Default)]
struct LedgerState {
  rows: Vec<VersionRow>,
  artifacts: BTreeMap<ArtifactKey, Descriptor>,
}

/// The version ledger: in-memory row store with optional JSON
/// persistence.
#[derive(Debug)]
pub struct Db {
  path: Option<PathBuf>,
  state: Mutex<LedgerState>,
  query_count: AtomicU64,
  query_time_nanos: AtomicU64,
}

impl Db {
  /// A ledger with no backing file. `persist` is a no-op.
  pub fn in_memory() -> Self {
    Self {
      path: None,
      state: Mutex::new(LedgerState::default()),
      query_count: AtomicU64::new(0),
      query_time_nanos: AtomicU64::new(0),
    }
  }

  /// Open (or create) a ledger backed by a JSON document.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, DbError> {
    let path = path.into();
    let file = store::load(&path)?;
    debug!(path = %path.display(), rows = file.rows.len(), "ledger opened");
    Ok(Self {
      path: Some(path),
      state: Mutex::new(LedgerState {
        rows: file.rows,
        artifacts: file.artifacts,
      }),
      query_count: AtomicU64::new(0),
      query_time_nanos: AtomicU64::new(0),
    })
  }

  /// Write the ledger to its backing file, atomically. No-op for
  /// in-memory ledgers.
  pub fn persist(&self) -> Result<(), DbError> {
    let Some(path) = &self.path else {
      return Ok(());
    };
    let file = self.measured(|state| LedgerFile {
      version: crate::consts::LEDGER_FORMAT_VERSION,
      rows: state.rows.clone(),
      artifacts: state.artifacts.clone(),
    });
    store::save(path, &file)
  }

  fn measured<T>(&self, op: impl FnOnce(&mut LedgerState) -> T) -> T {
    let started = Instant::now();
    self.query_count.fetch_add(1, Ordering::Relaxed);
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let result = op(&mut state);
    drop(state);
    self
      .query_time_nanos
      .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    result
  }

  /// Whether any version of `target` is recorded.
  pub fn has(&self, target: &ArtifactKey) -> bool {
    self.measured(|state| state.rows.iter().any(|row| &row.target == target))
  }

  /// Whether `target` at `version` is recorded.
  pub fn has_version(&self, target: &ArtifactKey, version: &Version) -> bool {
    self.measured(|state| {
      state
        .rows
        .iter()
        .any(|row| &row.target == target && &row.target_version == version)
    })
  }

  /// All recorded versions of `target`, deduplicated, in recording order.
  pub fn list_versions(&self, target: &ArtifactKey) -> Vec<Version> {
    self.measured(|state| {
      let mut versions: Vec<Version> = Vec::new();
      for row in state.rows.iter().filter(|row| &row.target == target) {
        if !versions.contains(&row.target_version) {
          versions.push(row.target_version.clone());
        }
      }
      versions
    })
  }

  /// The recorded `(source, version)` set for one prior build of
  /// `target`.
  pub fn list_version_sources(&self, target: &ArtifactKey, version: &Version) -> Vec<SourceVersion> {
    self.measured(|state| {
      state
        .rows
        .iter()
        .filter(|row| &row.target == target && &row.target_version == version)
        .map(|row| SourceVersion {
          source: row.source.clone(),
          version: row.source_version.clone(),
        })
        .collect()
    })
  }

  /// Append one row.
  pub fn record(&self, row: VersionRow) {
    self.measured(|state| state.rows.push(row));
  }

  /// Retract all rows for `target` and insert `rows` in their place, as
  /// one transaction. A concurrent reader never observes the target
  /// partially retracted.
  pub fn replace_target(&self, target: &ArtifactKey, rows: Vec<VersionRow>) {
    self.measured(|state| {
      state.rows.retain(|row| &row.target != target);
      state.rows.extend(rows);
    });
  }

  /// Remove rows for one version of `target`.
  pub fn retract(&self, target: &ArtifactKey, version: &Version) {
    self.measured(|state| {
      state
        .rows
        .retain(|row| !(&row.target == target && &row.target_version == version));
    });
  }

  /// Remove all rows for `target`.
  pub fn retract_target(&self, target: &ArtifactKey) {
    self.measured(|state| state.rows.retain(|row| &row.target != target));
  }

  /// Remove all rows produced by `rule`.
  pub fn retract_rule(&self, rule: &RuleKey) {
    self.measured(|state| state.rows.retain(|row| &row.rule != rule));
  }

  /// Which rule produced a specific recorded version of `target`.
  pub fn get_producing_rule(&self, target: &ArtifactKey, version: &Version) -> Option<RuleKey> {
    self.measured(|state| {
      state
        .rows
        .iter()
        .find(|row| &row.target == target && &row.target_version == version)
        .map(|row| row.rule.clone())
    })
  }

  /// All `(target, version)` pairs recorded for `rule`, deduplicated.
  pub fn list_rule_targets(&self, rule: &RuleKey) -> Vec<(ArtifactKey, Version)> {
    self.measured(|state| {
      let mut targets: Vec<(ArtifactKey, Version)> = Vec::new();
      for row in state.rows.iter().filter(|row| &row.rule == rule) {
        let pair = (row.target.clone(), row.target_version.clone());
        if !targets.contains(&pair) {
          targets.push(pair);
        }
      }
      targets
    })
  }

  /// All recorded target keys, deduplicated.
  pub fn targets(&self) -> Vec<ArtifactKey> {
    self.measured(|state| {
      let mut targets: Vec<ArtifactKey> = Vec::new();
      for row in &state.rows {
        if !targets.contains(&row.target) {
          targets.push(row.target.clone());
        }
      }
      targets
    })
  }

  /// Register an artifact descriptor for reverse lookup.
  pub fn record_artifact(&self, descriptor: &Descriptor) -> Result<(), DbError> {
    let key = descriptor.key().map_err(DbError::Serialize)?;
    self.measured(|state| {
      state.artifacts.insert(key, descriptor.clone());
    });
    Ok(())
  }

  /// Reverse-look up an artifact descriptor by key.
  pub fn lookup_artifact(&self, key: &ArtifactKey) -> Option<Descriptor> {
    self.measured(|state| state.artifacts.get(key).cloned())
  }

  pub fn query_count(&self) -> u64 {
    self.query_count.load(Ordering::Relaxed)
  }

  pub fn query_time(&self) -> Duration {
    Duration::from_nanos(self.query_time_nanos.load(Ordering::Relaxed))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::ObjectHash;
  use tempfile::tempdir;

  fn key(text: &str) -> ObjectHash {
    ObjectHash(text.to_string())
  }

  fn row(target: &str, target_version: &str, rule: &str, source: &str, source_version: &str) -> VersionRow {
    VersionRow {
      target: key(target),
      target_version: Version::new(target_version),
      rule: key(rule),
      source: key(source),
      source_version: Version::new(source_version),
    }
  }

  #[test]
  fn record_and_query_roundtrip() {
    let db = Db::in_memory();
    db.record(row("out", "v1", "r1", "in", "s1"));
    db.record(row("out", "v1", "r1", "recipe", "h1"));

    assert!(db.has(&key("out")));
    assert!(db.has_version(&key("out"), &Version::new("v1")));
    assert!(!db.has_version(&key("out"), &Version::new("v2")));

    let sources = db.list_version_sources(&key("out"), &Version::new("v1"));
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].source, key("in"));
    assert_eq!(sources[1].version, Version::new("h1"));

    assert_eq!(db.list_versions(&key("out")), vec![Version::new("v1")]);
    assert_eq!(
      db.get_producing_rule(&key("out"), &Version::new("v1")),
      Some(key("r1"))
    );
  }

  #[test]
  fn replace_target_swaps_the_whole_row_set() {
    let db = Db::in_memory();
    db.record(row("out", "v1", "r1", "in", "s1"));
    db.record(row("other", "v1", "r2", "in", "s1"));

    db.replace_target(&key("out"), vec![row("out", "v2", "r1", "in", "s2")]);

    assert!(!db.has_version(&key("out"), &Version::new("v1")));
    assert!(db.has_version(&key("out"), &Version::new("v2")));
    // Unrelated targets are untouched.
    assert!(db.has(&key("other")));
  }

  #[test]
  fn retraction_by_version_target_and_rule() {
    let db = Db::in_memory();
    db.record(row("out", "v1", "r1", "in", "s1"));
    db.record(row("out", "v2", "r1", "in", "s2"));
    db.record(row("log", "v1", "r2", "in", "s1"));

    db.retract(&key("out"), &Version::new("v1"));
    assert!(!db.has_version(&key("out"), &Version::new("v1")));
    assert!(db.has_version(&key("out"), &Version::new("v2")));

    db.retract_target(&key("out"));
    assert!(!db.has(&key("out")));

    db.retract_rule(&key("r2"));
    assert!(!db.has(&key("log")));
  }

  #[test]
  fn rule_targets_are_listed_without_duplicates() {
    let db = Db::in_memory();
    db.record(row("out", "v1", "r1", "a", "s1"));
    db.record(row("out", "v1", "r1", "b", "s2"));
    db.record(row("log", "v3", "r1", "a", "s1"));

    let targets = db.list_rule_targets(&key("r1"));
    assert_eq!(targets.len(), 2);
    assert!(targets.contains(&(key("out"), Version::new("v1"))));
    assert!(targets.contains(&(key("log"), Version::new("v3"))));
  }

  #[test]
  fn persistence_roundtrip() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("ledger.json");

    let db = Db::open(&path).unwrap();
    db.record(row("out", "v1", "r1", "in", "s1"));
    db.record_artifact(&Descriptor::new("file", "out.txt")).unwrap();
    db.persist().unwrap();

    let reloaded = Db::open(&path).unwrap();
    assert!(reloaded.has_version(&key("out"), &Version::new("v1")));

    let descriptor_key = Descriptor::new("file", "out.txt").key().unwrap();
    let descriptor = reloaded.lookup_artifact(&descriptor_key).unwrap();
    assert_eq!(descriptor.identity, "out.txt");
  }

  #[test]
  fn missing_ledger_file_loads_empty() {
    let temp = tempdir().unwrap();
    let db = Db::open(temp.path().join("absent.json")).unwrap();
    assert!(db.targets().is_empty());
  }

  #[test]
  fn unsupported_format_version_is_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("ledger.json");
    std::fs::write(&path, r#"{"version": 999, "rows": [], "artifacts": {}}"#).unwrap();

    assert!(matches!(Db::open(&path), Err(DbError::UnsupportedVersion(999))));
  }

  #[test]
  fn queries_are_measured() {
    let db = Db::in_memory();
    let before = db.query_count();
    db.record(row("out", "v1", "r1", "in", "s1"));
    db.has(&key("out"));
    assert_eq!(db.query_count(), before + 2);
  }
}
