//! Shell-command recipes.
//!
//! A `CommandRecipe` wraps a definer callback that assembles a
//! `CommandPlan`: the program or shell line, arguments, working
//! directory, environment, and output sinks. The same definer is shared
//! across rules; all contextual resolution (artifact references, module
//! directories) happens at concretization, producing a serializable
//! `CommandSpec` whose hash versions the recipe pseudo-artifact.
//!
//! Shell-mode commands run through a POSIX shell with strict failure
//! flags (`set -euo pipefail`) prefixed, so any failing stage of a
//! pipeline fails the whole recipe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::build::Build;
use crate::events::{BuildEvent, StreamKind};
use crate::job::Job;

use super::template;
use super::{Recipe, RecipeContext, RecipeError, RecipeSpec, TemplateError};

/// Flags prefixed to every shell-mode command line.
const SHELL_STRICT_FLAGS: &str = "set -euo pipefail";

/// A plain stream callback sink.
pub type StreamCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A job-aware stream callback sink, invoked with the job first.
pub type JobStreamCallback = Arc<dyn Fn(&Job, &[u8]) + Send + Sync>;

/// Where a command output stream goes.
///
/// A stream with no registered sinks is captured to an internal buffer
/// exposed through the job's captured output.
#[derive(Clone)]
pub enum OutputSink {
  /// Feed chunks to a callback.
  Callback(StreamCallback),

  /// Feed chunks to a job-aware callback.
  JobCallback(JobStreamCallback),

  /// Capture into an artifact: overwrite on the first chunk, append
  /// thereafter.
  Artifact(String),

  /// Capture into the job's in-memory buffer.
  Capture,
}

impl OutputSink {
  fn to_spec(&self) -> SinkSpec {
    match self {
      OutputSink::Callback(_) => SinkSpec::Callback,
      OutputSink::JobCallback(_) => SinkSpec::JobCallback,
      OutputSink::Artifact(reference) => SinkSpec::Artifact(reference.clone()),
      OutputSink::Capture => SinkSpec::Capture,
    }
  }
}

impl std::fmt::Debug for OutputSink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      OutputSink::Callback(_) => write!(f, "Callback"),
      OutputSink::JobCallback(_) => write!(f, "JobCallback"),
      OutputSink::Artifact(reference) => write!(f, "Artifact({reference})"),
      OutputSink::Capture => write!(f, "Capture"),
    }
  }
}

/// Structural description of a sink, used for spec hashing and
/// diagnostics. Callbacks are described by shape only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkSpec {
  Callback,
  JobCallback,
  Artifact(String),
  Capture,
}

impl std::fmt::Display for SinkSpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SinkSpec::Callback => write!(f, "callback"),
      SinkSpec::JobCallback => write!(f, "job-callback"),
      SinkSpec::Artifact(reference) => write!(f, "artifact {reference}"),
      SinkSpec::Capture => write!(f, "capture"),
    }
  }
}

/// The concretized, serializable command specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
  /// Program path, or the full command line in shell mode.
  pub exec: String,

  /// Arguments (empty in shell mode).
  pub args: Vec<String>,

  /// Whether `exec` runs through a shell with strict flags.
  pub shell: bool,

  /// Resolved working directory.
  pub cwd: String,

  /// Extra environment merged over the inherited one.
  pub env: BTreeMap<String, String>,

  pub stdout: Vec<SinkSpec>,
  pub stderr: Vec<SinkSpec>,
  pub combined: Vec<SinkSpec>,
}

impl CommandSpec {
  /// The literal command line, for diagnostics and error messages.
  pub fn command_line(&self) -> String {
    if self.shell || self.args.is_empty() {
      self.exec.clone()
    } else {
      let mut line = self.exec.clone();
      for arg in &self.args {
        line.push(' ');
        line.push_str(arg);
      }
      line
    }
  }

  fn describe(&self) -> String {
    let sinks = |specs: &[SinkSpec]| -> String {
      if specs.is_empty() {
        "capture".to_string()
      } else {
        specs.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
      }
    };
    format!(
      "{} (cwd {}; stdout: {}; stderr: {}; combined: {})",
      self.command_line(),
      self.cwd,
      sinks(&self.stdout),
      sinks(&self.stderr),
      sinks(&self.combined),
    )
  }
}

/// Accumulates one job's command while the definer callback runs.
///
/// Templates passed to `shell`, `arg_template`, and friends may embed
/// `$${...}` artifact references; they are resolved against the rule's
/// module immediately.
pub struct CommandPlan<'a> {
  ctx: &'a RecipeContext<'a>,
  exec: Option<String>,
  args: Vec<String>,
  shell_command: Option<String>,
  cwd: Option<String>,
  env: BTreeMap<String, String>,
  stdout: Vec<OutputSink>,
  stderr: Vec<OutputSink>,
  combined: Vec<OutputSink>,
}

impl<'a> CommandPlan<'a> {
  pub fn new(ctx: &'a RecipeContext<'a>) -> Self {
    Self {
      ctx,
      exec: None,
      args: Vec::new(),
      shell_command: None,
      cwd: None,
      env: BTreeMap::new(),
      stdout: Vec::new(),
      stderr: Vec::new(),
      combined: Vec::new(),
    }
  }

  fn resolve_template(&self, input: &str) -> Result<String, RecipeError> {
    let segments = template::parse(input)?;
    let rendered = template::render(&segments, |aid| {
      self
        .ctx
        .resolve_external(aid)
        .map_err(|e| TemplateError::Unresolved {
          reference: aid.to_string(),
          message: e.to_string(),
        })
    })?;
    Ok(rendered)
  }

  /// Set the program to execute directly (no shell).
  pub fn exec(&mut self, program: &str) -> Result<&mut Self, RecipeError> {
    self.exec = Some(self.resolve_template(program)?);
    Ok(self)
  }

  /// Append a literal argument.
  pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
    self.args.push(arg.into());
    self
  }

  /// Append an argument resolving an artifact reference to its external
  /// identifier.
  pub fn arg_ref(&mut self, reference: &str) -> Result<&mut Self, RecipeError> {
    let resolved = self.ctx.resolve_external(reference)?;
    self.args.push(resolved);
    Ok(self)
  }

  /// Append an argument with `$${...}` references resolved.
  pub fn arg_template(&mut self, arg: &str) -> Result<&mut Self, RecipeError> {
    let resolved = self.resolve_template(arg)?;
    self.args.push(resolved);
    Ok(self)
  }

  /// Run a full command line through a strict POSIX shell.
  pub fn shell(&mut self, command: &str) -> Result<&mut Self, RecipeError> {
    self.shell_command = Some(self.resolve_template(command)?);
    Ok(self)
  }

  /// Working directory; relative paths resolve against the rule's
  /// module directory.
  pub fn cwd(&mut self, dir: impl Into<String>) -> &mut Self {
    self.cwd = Some(dir.into());
    self
  }

  pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn stdout(&mut self, sink: OutputSink) -> &mut Self {
    self.stdout.push(sink);
    self
  }

  pub fn stderr(&mut self, sink: OutputSink) -> &mut Self {
    self.stderr.push(sink);
    self
  }

  pub fn combined(&mut self, sink: OutputSink) -> &mut Self {
    self.combined.push(sink);
    self
  }

  fn into_spec(self) -> Result<CommandSpec, RecipeError> {
    let (exec, shell, args) = match (self.shell_command, self.exec) {
      (Some(command), _) => (command, true, Vec::new()),
      (None, Some(program)) => (program, false, self.args),
      (None, None) => return Err(RecipeError::EmptyCommand),
    };

    let module_dir = self.ctx.manager.root().join(self.ctx.module());
    let cwd = match self.cwd {
      None => module_dir,
      Some(dir) if Path::new(&dir).is_absolute() => PathBuf::from(dir),
      Some(dir) => module_dir.join(dir),
    };
    let cwd = dunce::simplified(&cwd).display().to_string();

    Ok(CommandSpec {
      exec,
      args,
      shell,
      cwd,
      env: self.env,
      stdout: self.stdout.iter().map(OutputSink::to_spec).collect(),
      stderr: self.stderr.iter().map(OutputSink::to_spec).collect(),
      combined: self.combined.iter().map(OutputSink::to_spec).collect(),
    })
  }

  fn into_sink_bindings(self) -> (Vec<OutputSink>, Vec<OutputSink>, Vec<OutputSink>) {
    (self.stdout, self.stderr, self.combined)
  }
}

/// Builds a `CommandSpec` from a definer callback and executes it.
pub struct CommandRecipe {
  definer: Arc<dyn Fn(&mut CommandPlan<'_>) -> Result<(), RecipeError> + Send + Sync>,
}

impl CommandRecipe {
  pub fn new(definer: impl Fn(&mut CommandPlan<'_>) -> Result<(), RecipeError> + Send + Sync + 'static) -> Self {
    Self {
      definer: Arc::new(definer),
    }
  }

  /// Convenience: a recipe that runs one shell command line.
  pub fn shell(command: impl Into<String>) -> Self {
    let command = command.into();
    Self::new(move |plan| {
      plan.shell(&command)?;
      Ok(())
    })
  }

  fn plan_for<'a>(&self, ctx: &'a RecipeContext<'a>) -> Result<CommandPlan<'a>, RecipeError> {
    let mut plan = CommandPlan::new(ctx);
    (self.definer)(&mut plan)?;
    Ok(plan)
  }
}

#[async_trait]
impl Recipe for CommandRecipe {
  fn concretize(&self, ctx: &RecipeContext<'_>) -> Result<RecipeSpec, RecipeError> {
    let spec = self.plan_for(ctx)?.into_spec()?;
    let description = spec.describe();
    Ok(RecipeSpec::new("command", serde_json::to_value(&spec)?, description))
  }

  async fn execute(&self, job: &Arc<Job>, build: &Arc<Build>, spec: &RecipeSpec) -> Result<(), RecipeError> {
    let command_spec: CommandSpec = serde_json::from_value(spec.payload.clone())?;
    let command_line = command_spec.command_line();
    let rule_label = job.rule().label().to_string();

    // The spec carries only structural sink descriptions; rebuild the
    // plan to recover the actual bindings. Concretization is pure, so
    // this reproduces exactly what was hashed.
    let ctx = RecipeContext::new(job.rule(), build.manager());
    let (stdout_sinks, stderr_sinks, combined_sinks) = self.plan_for(&ctx)?.into_sink_bindings();

    let mut stdout_listeners = resolve_listeners(stdout_sinks, StreamKind::Stdout, job, build)?;
    let mut stderr_listeners = resolve_listeners(stderr_sinks, StreamKind::Stderr, job, build)?;
    let mut combined_listeners = resolve_listeners(combined_sinks, StreamKind::Combined, job, build)?;

    let mut command = if command_spec.shell {
      let program = build
        .options()
        .shell
        .clone()
        .unwrap_or_else(|| default_shell().to_string());
      let mut command = Command::new(program);
      command.arg("-c");
      command.arg(format!("{}\n{}", SHELL_STRICT_FLAGS, command_spec.exec));
      command
    } else {
      let mut command = Command::new(&command_spec.exec);
      command.args(&command_spec.args);
      command
    };

    command
      .current_dir(&command_spec.cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    for (key, value) in &command_spec.env {
      command.env(key, value);
    }

    info!(rule = %rule_label, command = %command_line, cwd = %command_spec.cwd, "spawning command");
    build.events().emit(BuildEvent::CommandSpawning {
      rule: rule_label.clone(),
      command: command_line.clone(),
    });

    let mut child = command.spawn().map_err(|source| RecipeError::Io {
      command: command_line.clone(),
      source,
    })?;

    build.events().emit(BuildEvent::CommandSpawned {
      rule: rule_label.clone(),
      pid: child.id(),
    });

    let io_error = |source: std::io::Error| RecipeError::Io {
      command: command_line.clone(),
      source,
    };

    let mut stdout = child
      .stdout
      .take()
      .ok_or_else(|| io_error(std::io::Error::other("stdout not piped")))?;
    let mut stderr = child
      .stderr
      .take()
      .ok_or_else(|| io_error(std::io::Error::other("stderr not piped")))?;

    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_done = false;
    let mut err_done = false;

    while !out_done || !err_done {
      tokio::select! {
        read = stdout.read(&mut out_buf), if !out_done => match read.map_err(&io_error)? {
          0 => out_done = true,
          n => {
            feed(&mut stdout_listeners, job, &out_buf[..n], &command_line).await?;
            feed(&mut combined_listeners, job, &out_buf[..n], &command_line).await?;
          }
        },
        read = stderr.read(&mut err_buf), if !err_done => match read.map_err(&io_error)? {
          0 => err_done = true,
          n => {
            feed(&mut stderr_listeners, job, &err_buf[..n], &command_line).await?;
            feed(&mut combined_listeners, job, &err_buf[..n], &command_line).await?;
          }
        },
      }
    }

    let status = child.wait().await.map_err(&io_error)?;

    for (stream, listeners) in [
      (StreamKind::Stdout, &stdout_listeners),
      (StreamKind::Stderr, &stderr_listeners),
      (StreamKind::Combined, &combined_listeners),
    ] {
      for listener in listeners {
        build.events().emit(BuildEvent::OutputCaptured {
          rule: rule_label.clone(),
          stream,
          artifact: listener.artifact_identity(),
        });
      }
    }

    debug!(rule = %rule_label, code = ?status.code(), "command completed");
    build.events().emit(BuildEvent::CommandCompleted {
      rule: rule_label.clone(),
      code: status.code(),
    });

    if status.success() {
      return Ok(());
    }

    match status.code() {
      Some(code) => Err(RecipeError::CommandFailed {
        rule: rule_label,
        command: command_line,
        code,
      }),
      None => Err(RecipeError::CommandSignaled {
        rule: rule_label,
        command: command_line,
        signal: termination_signal(&status),
      }),
    }
  }
}

/// The resolved runtime form of a sink.
enum Listener {
  Callback(StreamCallback),
  JobCallback(JobStreamCallback),
  File {
    identity: String,
    path: PathBuf,
    started: bool,
  },
  Capture(StreamKind),
}

impl Listener {
  fn artifact_identity(&self) -> Option<String> {
    match self {
      Listener::File { identity, .. } => Some(identity.clone()),
      _ => None,
    }
  }
}

fn resolve_listeners(
  sinks: Vec<OutputSink>,
  stream: StreamKind,
  job: &Arc<Job>,
  build: &Arc<Build>,
) -> Result<Vec<Listener>, RecipeError> {
  let sinks = if sinks.is_empty() { vec![OutputSink::Capture] } else { sinks };

  sinks
    .into_iter()
    .map(|sink| {
      Ok(match sink {
        OutputSink::Callback(callback) => Listener::Callback(callback),
        OutputSink::JobCallback(callback) => Listener::JobCallback(callback),
        OutputSink::Capture => Listener::Capture(stream),
        OutputSink::Artifact(reference) => {
          let artifact = build.manager().get(reference.as_str(), Some(job.rule().module()))?;
          let path = artifact
            .external_path()
            .ok_or_else(|| RecipeError::SinkNotWritable(artifact.identity().to_string()))?
            .to_path_buf();
          Listener::File {
            identity: artifact.identity().to_string(),
            path,
            started: false,
          }
        }
      })
    })
    .collect()
}

async fn feed(listeners: &mut [Listener], job: &Job, chunk: &[u8], command: &str) -> Result<(), RecipeError> {
  for listener in listeners.iter_mut() {
    match listener {
      Listener::Callback(callback) => callback(chunk),
      Listener::JobCallback(callback) => callback(job, chunk),
      Listener::Capture(stream) => job.append_captured(*stream, chunk),
      Listener::File { path, started, .. } => {
        let io_error = |source: std::io::Error| RecipeError::Io {
          command: command.to_string(),
          source,
        };
        if *started {
          let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(io_error)?;
          file.write_all(chunk).await.map_err(io_error)?;
        } else {
          // First chunk overwrites whatever was there before.
          tokio::fs::write(&path, chunk).await.map_err(io_error)?;
          *started = true;
        }
      }
    }
  }
  Ok(())
}

fn default_shell() -> &'static str {
  // `pipefail` predates POSIX sh on common systems; bash accepts the
  // strict flags everywhere we run.
  #[cfg(unix)]
  {
    "/bin/bash"
  }
  #[cfg(windows)]
  {
    "bash.exe"
  }
}

fn termination_signal(status: &std::process::ExitStatus) -> i32 {
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(-1)
  }
  #[cfg(not(unix))]
  {
    let _ = status;
    -1
  }
}
