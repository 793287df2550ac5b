//! The per-run orchestrator.
//!
//! One `Build` exists per run. It owns the ledger, the graph, the
//! artifact manager, the memoized job index, and the reliance table, and
//! is passed explicitly to every job it creates — there is no global
//! state. It implements the up-to-date algorithm, records fresh version
//! info after successful executions, and polices the run's central
//! correctness guarantee: every consumer of a given artifact observes
//! the same version of it, independent of scheduling order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::artifact::{Artifact, ArtifactError, ArtifactKey, ArtifactManager, ManagerError, Version};
use crate::db::{Db, DbError, SourceVersion, VersionRow};
use crate::events::EventBus;
use crate::graph::{Dependency, Graph, GraphError, Rule, RuleKey};
use crate::job::{Job, JobOutcome, JobSet};
use crate::recipe::RecipeError;
use crate::util::hash::{HashError, hash_key_set};

/// Run-wide configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Maximum number of recipes executing concurrently. Job
  /// orchestration itself is never throttled.
  pub parallelism: usize,

  /// Program used for shell-mode commands. Defaults to a bash.
  pub shell: Option<String>,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
      shell: None,
    }
  }
}

/// The latest recorded row-set for an output, keyed by its current
/// actual version.
#[derive(Debug, Clone)]
pub struct RecordedVersionInfo {
  pub target: ArtifactKey,
  pub version: Version,
  pub sources: Vec<SourceVersion>,
}

/// The fact that a rule relied on a specific version of an artifact
/// during this run.
#[derive(Debug, Clone)]
pub struct Reliance {
  pub rule: RuleKey,
  pub rule_label: String,
  pub version: Version,
}

/// Errors raised by the orchestrator and its jobs.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Manager(#[from] ManagerError),

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error(transparent)]
  Db(#[from] DbError),

  #[error(transparent)]
  Hash(#[from] HashError),

  /// A recipe failed; command errors already carry the rule label.
  #[error("{source}")]
  Recipe {
    rule: String,
    #[source]
    source: RecipeError,
  },

  /// A `Violation`-policy dependency was absent after its producer ran.
  #[error("rule `{rule}` requires `{artifact}`, which does not exist after its producer ran")]
  DependencyViolation { rule: String, artifact: String },

  /// Two rules observed different versions of one shared artifact.
  #[error("{message}")]
  RelianceConflict { message: String },

  /// An output consumed as an input earlier in the run was modified by
  /// its own recipe.
  #[error("rule `{rule}` rewrote `{artifact}` after it was already relied on this run")]
  RewriteAfterUse { rule: String, artifact: String },

  #[error("no rule produces `{artifact}` and it does not exist")]
  NoProducingRule { artifact: String },

  #[error("no reliance recorded for `{artifact}` by rule `{rule}`")]
  MissingReliance { rule: String, artifact: String },

  /// A prerequisite job failed; the message carries the causal chain.
  #[error("prerequisite of rule `{rule}` failed: {message}")]
  Prerequisite { rule: String, message: String },

  #[error("job task panicked: {0}")]
  Panicked(String),

  #[error("build run cancelled")]
  Cancelled,
}

/// Outcome summary of one run, reported regardless of success.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Labels of rules whose recipes executed.
  pub executed: Vec<String>,

  /// Labels of rules resolved as up to date.
  pub up_to_date: Vec<String>,

  /// Failing rules with their errors.
  pub failed: Vec<(String, Arc<BuildError>)>,

  pub db_queries: u64,
  pub db_query_time: Duration,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Format the reliance-conflict diagnostic: both rules, both versions,
/// and the artifact.
pub fn format_reliance_conflict_message(
  artifact: &str,
  first_rule: &str,
  first_version: &Version,
  second_rule: &str,
  second_version: &Version,
) -> String {
  format!(
    "conflicting versions of `{artifact}` observed in one run: \
     rule `{first_rule}` relied on version {first_version} \
     but rule `{second_rule}` observed version {second_version}"
  )
}

/// The per-run orchestrator.
pub struct Build {
  graph: Arc<Graph>,
  db: Arc<Db>,
  manager: Arc<ArtifactManager>,
  events: EventBus,
  options: BuildOptions,
  permits: Arc<Semaphore>,
  jobs: Mutex<HashMap<RuleKey, Arc<Job>>>,
  reliances: Mutex<HashMap<ArtifactKey, Vec<Reliance>>>,
}

impl Build {
  pub fn new(graph: Arc<Graph>, db: Arc<Db>, manager: Arc<ArtifactManager>) -> Arc<Self> {
    Self::with_options(graph, db, manager, BuildOptions::default(), EventBus::new())
  }

  pub fn with_options(
    graph: Arc<Graph>,
    db: Arc<Db>,
    manager: Arc<ArtifactManager>,
    options: BuildOptions,
    events: EventBus,
  ) -> Arc<Self> {
    let permits = Arc::new(Semaphore::new(options.parallelism.max(1)));
    Arc::new(Self {
      graph,
      db,
      manager,
      events,
      options,
      permits,
      jobs: Mutex::new(HashMap::new()),
      reliances: Mutex::new(HashMap::new()),
    })
  }

  pub fn graph(&self) -> &Arc<Graph> {
    &self.graph
  }

  pub fn db(&self) -> &Arc<Db> {
    &self.db
  }

  pub fn manager(&self) -> &Arc<ArtifactManager> {
    &self.manager
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  pub fn options(&self) -> &BuildOptions {
    &self.options
  }

  /// Permits bounding concurrent recipe executions.
  pub(crate) fn permits(&self) -> &Arc<Semaphore> {
    &self.permits
  }

  /// The memoized job for a rule: one job per rule per run. Creation is
  /// a compare-and-insert under the index lock, never a race.
  pub fn job_for(&self, rule: &Arc<Rule>, requested_by: Option<&Job>) -> Arc<Job> {
    let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(job) = jobs.get(rule.key()) {
      return job.clone();
    }
    let job = Job::new(rule.clone());
    if let Some(requester) = requested_by {
      job.set_requested_by(requester.rule().label());
    }
    jobs.insert(rule.key().clone(), job.clone());
    job
  }

  /// Snapshot of all jobs created so far in this run.
  pub fn jobs(&self) -> Vec<Arc<Job>> {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect()
  }

  /// Build the requested goal artifacts.
  ///
  /// Each goal is resolved to its producing rule and scheduled; a goal
  /// with no producing rule is accepted if it already exists on disk
  /// (a pure source) and rejected otherwise. Job failures land in the
  /// returned report; only setup problems (unresolvable goals, graph
  /// corruption) fail the call itself.
  pub async fn run(self: &Arc<Self>, goals: &[&str]) -> Result<BuildReport, BuildError> {
    self.graph.verify_acyclic()?;
    info!(goals = ?goals, "starting build run");

    let set = JobSet::new();
    for goal in goals {
      let artifact = self.manager.get(*goal, None)?;
      match self.graph.get_rule_for(artifact.as_ref()) {
        Some(rule) => {
          set.insert(self.job_for(&rule, None));
        }
        None => {
          if !artifact.exists().await? {
            return Err(BuildError::NoProducingRule {
              artifact: artifact.identity().to_string(),
            });
          }
          debug!(artifact = %artifact.identity(), "goal is an existing source; nothing to do");
        }
      }
    }

    let result = set.run(self).await;
    if let Err(e) = &result {
      error!(error = %e, "build run failed");
    }

    let mut report = BuildReport {
      db_queries: self.db.query_count(),
      db_query_time: self.db.query_time(),
      ..BuildReport::default()
    };
    let mut jobs = self.jobs();
    jobs.sort_by(|a, b| a.rule().label().cmp(b.rule().label()));
    for job in jobs {
      let label = job.rule().label().to_string();
      match job.outcome() {
        Some(Ok(JobOutcome::UpToDate)) => report.up_to_date.push(label),
        Some(Ok(JobOutcome::Executed)) => report.executed.push(label),
        Some(Err(e)) => report.failed.push((label, e)),
        None => {}
      }
    }

    info!(
      executed = report.executed.len(),
      up_to_date = report.up_to_date.len(),
      failed = report.failed.len(),
      db_queries = report.db_queries,
      "build run complete"
    );
    Ok(report)
  }

  /// The latest recorded row-set for `output`, read against its current
  /// actual version. Yields a sourceless "nonexistent" record when the
  /// output is absent or its current version was never recorded.
  pub async fn get_recorded_version_info(&self, output: &Arc<dyn Artifact>) -> Result<RecordedVersionInfo, BuildError> {
    let target = output.key().clone();
    let version = output.version().await?;

    if version.is_nonexistent() || !self.db.has_version(&target, &version) {
      return Ok(RecordedVersionInfo {
        target,
        version: Version::nonexistent(),
        sources: Vec::new(),
      });
    }

    let sources = self.db.list_version_sources(&target, &version);
    Ok(RecordedVersionInfo {
      target,
      version,
      sources,
    })
  }

  /// Live versions of every dependency; absent artifacts yield the
  /// nonexistent sentinel.
  pub async fn get_actual_version_info(
    &self,
    dependencies: &[Dependency],
  ) -> Result<HashMap<ArtifactKey, Version>, BuildError> {
    let mut versions = HashMap::with_capacity(dependencies.len());
    for dependency in dependencies {
      let version = dependency.artifact.version().await?;
      versions.insert(dependency.key().clone(), version);
    }
    Ok(versions)
  }

  /// The up-to-date determination for a prepared job.
  ///
  /// Unconditionally stale when the rule is `always` or a synthetic
  /// source rule. Otherwise, for every declared output: the recorded
  /// source-key set (sorted, hashed) must equal the actual current
  /// dependency-key set, every recorded source version must equal its
  /// current actual version, and the output must exist on disk.
  pub async fn is_up_to_date(&self, job: &Job) -> Result<bool, BuildError> {
    let rule = job.rule();
    if rule.always() || rule.is_source() {
      return Ok(false);
    }
    // With no outputs there is nothing to check freshness against.
    if rule.outputs().is_empty() {
      return Ok(false);
    }

    let dependencies = job.dependencies();
    let actual = self.get_actual_version_info(&dependencies).await?;
    let actual_key_hash = hash_key_set(actual.keys());

    for output in rule.outputs().values() {
      let output_version = output.version().await?;
      if output_version.is_nonexistent() {
        debug!(rule = %rule.label(), output = %output.identity(), "output missing; stale");
        return Ok(false);
      }
      if !self.db.has_version(output.key(), &output_version) {
        debug!(rule = %rule.label(), output = %output.identity(), "output version unrecorded; stale");
        return Ok(false);
      }

      let sources = self.db.list_version_sources(output.key(), &output_version);
      let recorded_keys: Vec<ArtifactKey> = sources.iter().map(|s| s.source.clone()).collect();
      if hash_key_set(recorded_keys.iter()) != actual_key_hash {
        debug!(rule = %rule.label(), output = %output.identity(), "dependency set changed; stale");
        return Ok(false);
      }

      for source in &sources {
        match actual.get(&source.source) {
          Some(version) if *version == source.version => {}
          _ => {
            debug!(
              rule = %rule.label(),
              output = %output.identity(),
              source = %source.source,
              "dependency version changed; stale"
            );
            return Ok(false);
          }
        }
      }
    }

    Ok(true)
  }

  /// Retract all prior rows for each of the job's outputs and write a
  /// fresh row per (output, dependency) pair at their now-current
  /// versions. The job's dependency list includes the recipe
  /// pseudo-artifact, so a changed command invalidates outputs even
  /// with unchanged file dependencies.
  pub async fn record_version_info(
    &self,
    job: &Job,
    observed: &HashMap<ArtifactKey, Version>,
  ) -> Result<(), BuildError> {
    let rule = job.rule();
    let dependencies = job.dependencies();

    let mut sources: Vec<(ArtifactKey, Version)> = Vec::with_capacity(dependencies.len());
    for dependency in &dependencies {
      let key = dependency.key().clone();
      let version = match observed.get(&key) {
        Some(version) => version.clone(),
        // Discovered mid-execution; its current version is the one used.
        None => dependency.artifact.version().await?,
      };
      self.db.record_artifact(&dependency.artifact.descriptor())?;
      sources.push((key, version));
    }

    for output in job.outputs() {
      let target = output.key().clone();
      let target_version = output.version().await?;
      self.db.record_artifact(&output.descriptor())?;

      let rows: Vec<VersionRow> = sources
        .iter()
        .map(|(source, source_version)| VersionRow {
          target: target.clone(),
          target_version: target_version.clone(),
          rule: rule.key().clone(),
          source: source.clone(),
          source_version: source_version.clone(),
        })
        .collect();
      self.db.replace_target(&target, rows);
      debug!(rule = %rule.label(), target = %output.identity(), version = %target_version, "recorded version info");
    }

    self.db.persist()?;
    Ok(())
  }

  /// Register that `rule` relied on `version` of `artifact` during this
  /// run. The first registration fixes the version every later consumer
  /// must observe; a mismatch is a reliance conflict.
  pub fn record_reliance(&self, rule: &Rule, artifact: &dyn Artifact, version: &Version) -> Result<(), BuildError> {
    let mut reliances = self.reliances.lock().unwrap_or_else(PoisonError::into_inner);
    match reliances.entry(artifact.key().clone()) {
      Entry::Vacant(slot) => {
        slot.insert(vec![Reliance {
          rule: rule.key().clone(),
          rule_label: rule.label().to_string(),
          version: version.clone(),
        }]);
        Ok(())
      }
      Entry::Occupied(mut slot) => {
        let first = &slot.get()[0];
        if first.version != *version {
          let message = format_reliance_conflict_message(
            artifact.identity(),
            &first.rule_label,
            &first.version,
            rule.label(),
            version,
          );
          error!(artifact = %artifact.identity(), "{message}");
          return Err(BuildError::RelianceConflict { message });
        }
        if !slot.get().iter().any(|r| &r.rule == rule.key()) {
          slot.get_mut().push(Reliance {
            rule: rule.key().clone(),
            rule_label: rule.label().to_string(),
            version: version.clone(),
          });
        }
        Ok(())
      }
    }
  }

  /// The version `rule` relied on for `artifact`, if any. With
  /// `required`, absence is an error.
  pub fn get_version_relied_on(
    &self,
    rule: &Rule,
    artifact: &dyn Artifact,
    required: bool,
  ) -> Result<Option<Version>, BuildError> {
    let reliances = self.reliances.lock().unwrap_or_else(PoisonError::into_inner);
    let found = reliances
      .get(artifact.key())
      .and_then(|entries| entries.iter().find(|r| &r.rule == rule.key()))
      .map(|r| r.version.clone());

    if found.is_none() && required {
      return Err(BuildError::MissingReliance {
        rule: rule.label().to_string(),
        artifact: artifact.identity().to_string(),
      });
    }
    Ok(found)
  }

  /// All reliances registered against an artifact this run.
  pub fn get_artifact_reliances(&self, artifact_key: &ArtifactKey) -> Vec<Reliance> {
    self
      .reliances
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(artifact_key)
      .cloned()
      .unwrap_or_default()
  }
}

impl std::fmt::Debug for Build {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Build")
      .field("graph", &self.graph)
      .field("options", &self.options)
      .finish()
  }
}
