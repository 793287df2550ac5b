//! The scheduler: jobs and job sets.
//!
//! A `Job` is one run-scoped execution attempt of a rule, created lazily
//! and memoized in the `Build`'s index so a rule's recipe runs at most
//! once per run no matter how many dependents await it. Jobs recursively
//! materialize their prerequisites into a `JobSet` — a deduplicated,
//! concurrently-run container — then check up-to-dateness against the
//! ledger, conditionally invoke their recipe, and record fresh version
//! info.
//!
//! Ordering: a job never begins recipe execution before every
//! prerequisite reachable via dependency and `after` edges has finished.
//! `also` rules are co-required but unordered relative to the inducing
//! job. Failures propagate to every awaiter; already-started sibling
//! jobs run to completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::artifact::{Artifact, ArtifactKey, RecipeArtifact, Version};
use crate::build::{Build, BuildError};
use crate::events::{BuildEvent, StreamKind};
use crate::graph::{AbsencePolicy, Dependency, Rule, RuleKey};
use crate::recipe::{Recipe, RecipeContext, RecipeSpec};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Created,
  Preparing,
  AwaitingPrerequisites,
  Executing,
  UpToDate,
  Recording,
  Finished,
  Error,
}

/// How a finished job resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
  /// All outputs passed the up-to-date check; the recipe was skipped.
  UpToDate,

  /// The recipe ran (or the rule was a source rule) and version info
  /// was recorded.
  Executed,
}

/// Command output captured for streams with no explicit sink.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
  pub combined: Vec<u8>,
}

impl CapturedOutput {
  pub fn stdout_lossy(&self) -> String {
    String::from_utf8_lossy(&self.stdout).to_string()
  }

  pub fn stderr_lossy(&self) -> String {
    String::from_utf8_lossy(&self.stderr).to_string()
  }

  pub fn combined_lossy(&self) -> String {
    String::from_utf8_lossy(&self.combined).to_string()
  }
}

/// One run-scoped execution attempt of a rule.
pub struct Job {
  rule: Arc<Rule>,
  state: Mutex<JobState>,
  requested_by: Mutex<Option<String>>,
  dependencies: Mutex<Vec<Dependency>>,
  dynamic_outputs: Mutex<Vec<Arc<dyn Artifact>>>,
  captured: Mutex<CapturedOutput>,
  spec: Mutex<Option<RecipeSpec>>,
  job_error: Mutex<Option<Arc<BuildError>>>,
  once: OnceCell<Result<JobOutcome, Arc<BuildError>>>,
}

impl Job {
  pub(crate) fn new(rule: Arc<Rule>) -> Arc<Self> {
    Arc::new(Self {
      rule,
      state: Mutex::new(JobState::Created),
      requested_by: Mutex::new(None),
      dependencies: Mutex::new(Vec::new()),
      dynamic_outputs: Mutex::new(Vec::new()),
      captured: Mutex::new(CapturedOutput::default()),
      spec: Mutex::new(None),
      job_error: Mutex::new(None),
      once: OnceCell::new(),
    })
  }

  pub fn rule(&self) -> &Arc<Rule> {
    &self.rule
  }

  pub fn state(&self) -> JobState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: JobState) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Label of the job that first requested this one, for diagnostics.
  pub fn requested_by(&self) -> Option<String> {
    self.requested_by.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub(crate) fn set_requested_by(&self, label: &str) {
    let mut requested_by = self.requested_by.lock().unwrap_or_else(PoisonError::into_inner);
    if requested_by.is_none() {
      *requested_by = Some(label.to_string());
    }
  }

  /// The live dependency list: declared dependencies, the recipe
  /// pseudo-artifact, and anything discovered at run time.
  pub fn dependencies(&self) -> Vec<Dependency> {
    self.dependencies.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub(crate) fn bind_dependencies(&self, dependencies: Vec<Dependency>) {
    *self.dependencies.lock().unwrap_or_else(PoisonError::into_inner) = dependencies;
  }

  /// Declare a dependency discovered during recipe execution.
  pub fn add_discovered_dependency(&self, dependency: Dependency) {
    let mut dependencies = self.dependencies.lock().unwrap_or_else(PoisonError::into_inner);
    if !dependencies.iter().any(|d| d.key() == dependency.key()) {
      dependencies.push(dependency);
    }
  }

  /// Declare an output discovered during recipe execution.
  pub fn add_discovered_output(&self, artifact: Arc<dyn Artifact>) {
    let mut outputs = self.dynamic_outputs.lock().unwrap_or_else(PoisonError::into_inner);
    if !outputs.iter().any(|o| o.key() == artifact.key()) {
      outputs.push(artifact);
    }
  }

  /// Declared plus dynamically discovered outputs.
  pub fn outputs(&self) -> Vec<Arc<dyn Artifact>> {
    let mut outputs: Vec<Arc<dyn Artifact>> = self.rule.outputs().values().cloned().collect();
    for dynamic in self.dynamic_outputs.lock().unwrap_or_else(PoisonError::into_inner).iter() {
      if !outputs.iter().any(|o| o.key() == dynamic.key()) {
        outputs.push(dynamic.clone());
      }
    }
    outputs
  }

  /// Output captured from command streams with no explicit sink.
  pub fn captured(&self) -> CapturedOutput {
    self.captured.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub(crate) fn append_captured(&self, stream: StreamKind, chunk: &[u8]) {
    let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
    match stream {
      StreamKind::Stdout => captured.stdout.extend_from_slice(chunk),
      StreamKind::Stderr => captured.stderr.extend_from_slice(chunk),
      StreamKind::Combined => captured.combined.extend_from_slice(chunk),
    }
  }

  /// This run's concretized recipe spec, once prepared.
  pub fn spec(&self) -> Option<RecipeSpec> {
    self.spec.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn set_spec(&self, spec: Option<RecipeSpec>) {
    *self.spec.lock().unwrap_or_else(PoisonError::into_inner) = spec;
  }

  /// The fatal error this job ended with, if any.
  pub fn error(&self) -> Option<Arc<BuildError>> {
    self.job_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn record_error(&self, e: Arc<BuildError>) {
    self.set_state(JobState::Error);
    *self.job_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
  }

  /// Terminal result, once the job finished either way.
  pub fn outcome(&self) -> Option<Result<JobOutcome, Arc<BuildError>>> {
    self.once.get().cloned()
  }

  /// Run the job, memoized: concurrent requesters share one execution,
  /// and every awaiter observes the same result.
  pub fn run(self: &Arc<Self>, build: &Arc<Build>) -> BoxFuture<'static, Result<JobOutcome, Arc<BuildError>>> {
    let this = self.clone();
    let build = build.clone();
    Box::pin(async move {
      let init_this = this.clone();
      this
        .once
        .get_or_init(move || async move {
          let label = init_this.rule.label().to_string();
          match init_this.clone().work(build).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
              let shared = Arc::new(e);
              error!(rule = %label, error = %shared, "job failed");
              init_this.record_error(shared.clone());
              Err(shared)
            }
          }
        })
        .await
        .clone()
    })
  }

  fn work(self: Arc<Self>, build: Arc<Build>) -> BoxFuture<'static, Result<JobOutcome, BuildError>> {
    Box::pin(async move {
      let rule = self.rule.clone();
      let label = rule.label().to_string();

      self.set_state(JobState::Preparing);
      build.events().emit(BuildEvent::RuleDefining { rule: label.clone() });

      // Bind declared dependencies plus the recipe pseudo-artifact.
      let mut dependencies: Vec<Dependency> = rule.dependencies().values().cloned().collect();
      let mut spec: Option<RecipeSpec> = None;
      if let Some(recipe) = rule.recipe() {
        let ctx = RecipeContext::new(&rule, build.manager());
        let concretized = recipe.concretize(&ctx).map_err(|source| BuildError::Recipe {
          rule: label.clone(),
          source,
        })?;
        let spec_hash = concretized.spec_hash()?;
        let recipe_artifact: Arc<dyn Artifact> = Arc::new(RecipeArtifact::new(rule.identity(), spec_hash)?);
        dependencies.push(Dependency::stateful(recipe_artifact));
        spec = Some(concretized);
      }
      self.set_spec(spec.clone());

      for dependency in &dependencies {
        build.events().emit(BuildEvent::DependencyAdded {
          rule: label.clone(),
          artifact: dependency.artifact.identity().to_string(),
        });
      }
      for output in rule.outputs().values() {
        build.events().emit(BuildEvent::OutputAdded {
          rule: label.clone(),
          artifact: output.identity().to_string(),
        });
      }
      self.bind_dependencies(dependencies.clone());

      // Prerequisite discovery: producers of dependencies, plus `after`
      // rules unconditionally; each prerequisite brings its own `also`
      // closure along.
      let prerequisites = JobSet::new();
      for dependency in &dependencies {
        if let Some(producer) = build.graph().get_rule_for(dependency.artifact.as_ref())
          && producer.key() != rule.key()
        {
          insert_with_also(&prerequisites, &build, &producer, &self);
        }
      }
      for after_rule in rule.after().values() {
        insert_with_also(&prerequisites, &build, after_rule, &self);
      }

      // This rule's own `also` closure is co-required but unordered:
      // it runs concurrently with this job and is joined before finish.
      let also = JobSet::new();
      for also_rule in rule.also().values() {
        insert_with_also(&also, &build, also_rule, &self);
      }
      let also_run = if also.is_empty() {
        None
      } else {
        Some(tokio::spawn(also.run(&build)))
      };

      self.set_state(JobState::AwaitingPrerequisites);
      if let Err(e) = prerequisites.run(&build).await {
        return Err(BuildError::Prerequisite {
          rule: label.clone(),
          message: e.to_string(),
        });
      }

      // Verify dependencies and observe the versions this job consumes.
      let mut observed: HashMap<ArtifactKey, Version> = HashMap::new();
      for dependency in &dependencies {
        let version = dependency.artifact.version().await?;
        if version.is_nonexistent() && dependency.when_absent == AbsencePolicy::Violation {
          return Err(BuildError::DependencyViolation {
            rule: label.clone(),
            artifact: dependency.artifact.identity().to_string(),
          });
        }
        observed.insert(dependency.key().clone(), version);
      }

      let fresh = build.is_up_to_date(&self).await?;
      let outcome = if fresh {
        self.set_state(JobState::UpToDate);
        debug!(rule = %label, "up to date");
        JobOutcome::UpToDate
      } else {
        if let (Some(recipe), Some(spec)) = (rule.recipe(), &spec) {
          self.set_state(JobState::Executing);
          build.events().emit(BuildEvent::RecipeInvoked { rule: label.clone() });

          // The permit bounds recipe executions only; holding it across
          // the prerequisite await above could deadlock a deep graph.
          let permit = build
            .permits()
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BuildError::Cancelled)?;
          let result = recipe.execute(&self, &build, spec).await;
          drop(permit);
          result.map_err(|source| BuildError::Recipe {
            rule: label.clone(),
            source,
          })?;
        }

        // Rewrite-after-use: an artifact this job consumed whose version
        // the recipe changed while it is also one of this job's outputs
        // would invalidate reliances already handed out.
        let output_keys: HashSet<ArtifactKey> = self.outputs().iter().map(|o| o.key().clone()).collect();
        for dependency in self.dependencies() {
          if output_keys.contains(dependency.key())
            && let Some(before) = observed.get(dependency.key())
          {
            let after = dependency.artifact.version().await?;
            if &after != before {
              return Err(BuildError::RewriteAfterUse {
                rule: label.clone(),
                artifact: dependency.artifact.identity().to_string(),
              });
            }
          }
        }

        self.set_state(JobState::Recording);
        build.record_version_info(&self, &observed).await?;
        JobOutcome::Executed
      };

      // Register reliances for every dependency actually used.
      for dependency in self.dependencies() {
        let version = match observed.get(dependency.key()) {
          Some(version) => version.clone(),
          None => dependency.artifact.version().await?,
        };
        build.record_reliance(&rule, dependency.artifact.as_ref(), &version)?;
      }

      if let Some(handle) = also_run {
        match handle.await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            return Err(BuildError::Prerequisite {
              rule: label.clone(),
              message: format!("co-required rule failed: {e}"),
            });
          }
          Err(join_error) => return Err(BuildError::Panicked(join_error.to_string())),
        }
      }

      self.set_state(JobState::Finished);
      build.events().emit(BuildEvent::RuleDefined { rule: label });
      Ok(outcome)
    })
  }
}

impl std::fmt::Debug for Job {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Job")
      .field("rule", &self.rule.label())
      .field("state", &self.state())
      .finish()
  }
}

/// Insert a rule's job and, recursively, its `also` closure. Dedup via
/// the set terminates recursion on cyclic `also` references.
fn insert_with_also(set: &Arc<JobSet>, build: &Arc<Build>, rule: &Arc<Rule>, requester: &Job) {
  let job = build.job_for(rule, Some(requester));
  if set.insert(job) {
    for also_rule in rule.also().values() {
      insert_with_also(set, build, also_rule, requester);
    }
  }
}

/// An unordered, deduplicated-by-rule-key collection of jobs that run
/// concurrently. `run()` is memoized.
pub struct JobSet {
  jobs: Mutex<HashMap<RuleKey, Arc<Job>>>,
  once: OnceCell<Result<(), Arc<BuildError>>>,
}

impl JobSet {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      jobs: Mutex::new(HashMap::new()),
      once: OnceCell::new(),
    })
  }

  /// Add a job; returns false when its rule is already a member.
  pub fn insert(&self, job: Arc<Job>) -> bool {
    let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    match jobs.entry(job.rule().key().clone()) {
      std::collections::hash_map::Entry::Occupied(_) => false,
      std::collections::hash_map::Entry::Vacant(slot) => {
        slot.insert(job);
        true
      }
    }
  }

  pub fn contains(&self, rule_key: &RuleKey) -> bool {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(rule_key)
  }

  pub fn members(&self) -> Vec<Arc<Job>> {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// A new set containing the members of both sets.
  pub fn union(&self, other: &JobSet) -> Arc<JobSet> {
    let set = JobSet::new();
    for job in self.members() {
      set.insert(job);
    }
    for job in other.members() {
      set.insert(job);
    }
    set
  }

  /// A new set with the members of `self` not in `other`.
  pub fn difference(&self, other: &JobSet) -> Arc<JobSet> {
    let set = JobSet::new();
    for job in self.members() {
      if !other.contains(job.rule().key()) {
        set.insert(job);
      }
    }
    set
  }

  /// Run all member jobs concurrently, memoized.
  ///
  /// Every member runs to completion even after a sibling fails; the
  /// first failure is then returned to all awaiters.
  pub fn run(self: &Arc<Self>, build: &Arc<Build>) -> BoxFuture<'static, Result<(), Arc<BuildError>>> {
    let this = self.clone();
    let build = build.clone();
    Box::pin(async move {
      let init_this = this.clone();
      this
        .once
        .get_or_init(move || async move {
          let mut tasks = JoinSet::new();
          for job in init_this.members() {
            let build = build.clone();
            tasks.spawn(async move {
              let label = job.rule().label().to_string();
              (label, job.run(&build).await)
            });
          }

          let mut first_error: Option<Arc<BuildError>> = None;
          while let Some(joined) = tasks.join_next().await {
            match joined {
              Ok((_, Ok(_))) => {}
              Ok((label, Err(e))) => {
                warn!(rule = %label, error = %e, "job in set failed");
                if first_error.is_none() {
                  first_error = Some(e);
                }
              }
              Err(join_error) => {
                error!(error = %join_error, "job task panicked");
                if first_error.is_none() {
                  first_error = Some(Arc::new(BuildError::Panicked(join_error.to_string())));
                }
              }
            }
          }

          match first_error {
            Some(e) => Err(e),
            None => Ok(()),
          }
        })
        .await
        .clone()
    })
  }
}

impl std::fmt::Debug for JobSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobSet").field("jobs", &self.len()).finish()
  }
}
