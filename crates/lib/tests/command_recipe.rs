//! Command-recipe stream handling, exercised through real build runs.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use girder_lib::artifact::ArtifactManager;
use girder_lib::build::{Build, BuildOptions};
use girder_lib::db::Db;
use girder_lib::events::{BuildEvent, CollectingSink, EventBus, StreamKind};
use girder_lib::graph::{Graph, Rule};
use girder_lib::job::Job;
use girder_lib::recipe::{AroundHook, CommandRecipe, DelayedRecipe, Hook, OutputSink, Recipe, WrapperRecipe};

struct Workspace {
  _temp: TempDir,
  root: std::path::PathBuf,
  manager: Arc<ArtifactManager>,
}

impl Workspace {
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();
    Self {
      manager: Arc::new(ArtifactManager::new(&root)),
      _temp: temp,
      root,
    }
  }
}

/// Build one rule with `recipe`, run it, and return the build handle
/// (for job inspection) plus the event sink.
async fn run_rule(ws: &Workspace, recipe: impl Recipe + 'static) -> (Arc<Build>, Arc<CollectingSink>) {
  let output = ws.manager.get("marker.out", None).unwrap();

  let mut graph = Graph::new();
  graph
    .add_rule(
      Rule::builder("cmd")
        .output(output)
        .always()
        .recipe(Arc::new(recipe)),
    )
    .unwrap();

  let sink = CollectingSink::new();
  let mut bus = EventBus::new();
  bus.subscribe(sink.clone());

  let build = Build::with_options(
    Arc::new(graph),
    Arc::new(Db::in_memory()),
    ws.manager.clone(),
    BuildOptions::default(),
    bus,
  );
  let report = build.run(&["marker.out"]).await.unwrap();
  assert!(report.is_success(), "failed: {:?}", report.failed);
  (build, sink)
}

fn the_job(build: &Arc<Build>) -> Arc<Job> {
  build.jobs().into_iter().find(|j| j.rule().label() == "cmd").unwrap()
}

#[tokio::test]
async fn unsinked_streams_are_captured_on_the_job() {
  let ws = Workspace::new();
  let recipe = CommandRecipe::shell("echo visible\necho hidden 1>&2\ntouch marker.out");

  let (build, _) = run_rule(&ws, recipe).await;
  let captured = the_job(&build).captured();

  assert_eq!(captured.stdout_lossy(), "visible\n");
  assert_eq!(captured.stderr_lossy(), "hidden\n");
  // The synthesized combined stream sees both.
  assert!(captured.combined_lossy().contains("visible"));
  assert!(captured.combined_lossy().contains("hidden"));
}

#[tokio::test]
async fn artifact_sink_overwrites_then_appends() {
  let ws = Workspace::new();
  // Stale content from an earlier run must be overwritten, not appended.
  std::fs::write(ws.root.join("build.log"), "stale\n").unwrap();

  let recipe = CommandRecipe::new(|plan| {
    plan.shell("echo first\nsleep 0.05\necho second\ntouch marker.out")?;
    plan.stdout(OutputSink::Artifact("build.log".to_string()));
    Ok(())
  });

  let (build, sink) = run_rule(&ws, recipe).await;

  let log = std::fs::read_to_string(ws.root.join("build.log")).unwrap();
  assert!(!log.contains("stale"));
  assert!(log.contains("first"));
  assert!(log.contains("second"));

  // An explicit stdout sink replaces the default capture buffer.
  assert!(the_job(&build).captured().stdout.is_empty());
  assert_eq!(
    sink.count_where(|e| matches!(
      e,
      BuildEvent::OutputCaptured {
        stream: StreamKind::Stdout,
        artifact: Some(identity),
        ..
      } if identity == "build.log"
    )),
    1
  );
}

#[tokio::test]
async fn callback_and_job_callback_sinks_receive_chunks() {
  let ws = Workspace::new();

  let plain: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
  let labelled: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

  let plain_sink = plain.clone();
  let labelled_sink = labelled.clone();
  let recipe = CommandRecipe::new(move |plan| {
    plan.shell("echo chunked\ntouch marker.out")?;
    let plain_sink = plain_sink.clone();
    plan.stdout(OutputSink::Callback(Arc::new(move |chunk: &[u8]| {
      plain_sink.lock().unwrap().extend_from_slice(chunk);
    })));
    let labelled_sink = labelled_sink.clone();
    plan.stdout(OutputSink::JobCallback(Arc::new(move |job: &Job, chunk: &[u8]| {
      labelled_sink
        .lock()
        .unwrap()
        .push(format!("{}: {}", job.rule().label(), String::from_utf8_lossy(chunk)));
    })));
    Ok(())
  });

  run_rule(&ws, recipe).await;

  assert_eq!(String::from_utf8_lossy(&plain.lock().unwrap()), "chunked\n");
  let labelled = labelled.lock().unwrap();
  assert_eq!(labelled.len(), 1);
  assert!(labelled[0].starts_with("cmd: chunked"));
}

#[tokio::test]
async fn command_lifecycle_events_are_emitted() {
  let ws = Workspace::new();
  let recipe = CommandRecipe::shell("touch marker.out");

  let (_, sink) = run_rule(&ws, recipe).await;

  assert_eq!(
    sink.count_where(|e| matches!(e, BuildEvent::CommandSpawning { command, .. } if command.contains("touch"))),
    1
  );
  assert_eq!(
    sink.count_where(|e| matches!(e, BuildEvent::CommandSpawned { pid: Some(_), .. })),
    1
  );
  assert_eq!(
    sink.count_where(|e| matches!(e, BuildEvent::CommandCompleted { code: Some(0), .. })),
    1
  );
  assert_eq!(
    sink.count_where(|e| matches!(e, BuildEvent::RecipeInvoked { rule } if rule == "cmd")),
    1
  );
}

#[tokio::test]
async fn pipeline_failures_fail_the_recipe() {
  let ws = Workspace::new();

  let output = ws.manager.get("never.out", None).unwrap();
  let mut graph = Graph::new();
  graph
    .add_rule(
      Rule::builder("pipeline")
        .output(output)
        // `false | cat` exits 0 without pipefail; the strict prefix
        // must surface the failing stage.
        .recipe(Arc::new(CommandRecipe::shell("false | cat > never.out"))),
    )
    .unwrap();

  let build = Build::new(
    Arc::new(graph),
    Arc::new(Db::in_memory()),
    ws.manager.clone(),
  );
  let report = build.run(&["never.out"]).await.unwrap();
  assert!(!report.is_success());
}

#[tokio::test]
async fn exec_mode_runs_without_a_shell() {
  let ws = Workspace::new();
  std::fs::write(ws.root.join("words.txt"), "alpha beta\n").unwrap();

  let recipe = CommandRecipe::new(|plan| {
    plan.exec("/bin/cat")?;
    plan.arg_ref("words.txt")?;
    Ok(())
  });

  let output = ws.manager.get("words.txt", None).unwrap();
  let mut graph = Graph::new();
  graph
    .add_rule(Rule::builder("cat").output(output).always().recipe(Arc::new(recipe)))
    .unwrap();

  let build = Build::new(
    Arc::new(graph),
    Arc::new(Db::in_memory()),
    ws.manager.clone(),
  );
  let report = build.run(&["words.txt"]).await.unwrap();
  assert!(report.is_success(), "failed: {:?}", report.failed);

  let job = build.jobs().into_iter().find(|j| j.rule().label() == "cat").unwrap();
  assert_eq!(job.captured().stdout_lossy(), "alpha beta\n");
}

#[tokio::test]
async fn delayed_recipe_defers_execution() {
  let ws = Workspace::new();
  let inner = Arc::new(CommandRecipe::shell("touch marker.out"));
  let recipe = DelayedRecipe::new(inner, std::time::Duration::from_millis(80));

  let started = std::time::Instant::now();
  run_rule(&ws, recipe).await;

  assert!(started.elapsed() >= std::time::Duration::from_millis(80));
  assert!(ws.root.join("marker.out").exists());
}

#[tokio::test]
async fn wrapper_hooks_run_in_order_around_the_inner_recipe() {
  let ws = Workspace::new();
  let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

  let before_order = order.clone();
  let before: Hook = Arc::new(move |_job| {
    let order = before_order.clone();
    Box::pin(async move {
      order.lock().unwrap().push("before");
      Ok(())
    })
  });

  let around_order = order.clone();
  let around: AroundHook = Arc::new(move |_job, proceed| {
    let order = around_order.clone();
    Box::pin(async move {
      order.lock().unwrap().push("around-start");
      proceed.await?;
      order.lock().unwrap().push("around-end");
      Ok(())
    })
  });

  let after_order = order.clone();
  let after: Hook = Arc::new(move |_job| {
    let order = after_order.clone();
    Box::pin(async move {
      order.lock().unwrap().push("after");
      Ok(())
    })
  });

  let recipe = WrapperRecipe::new(Arc::new(CommandRecipe::shell("touch marker.out")))
    .before(before)
    .around(around)
    .after(after);

  run_rule(&ws, recipe).await;

  assert_eq!(
    *order.lock().unwrap(),
    vec!["before", "around-start", "around-end", "after"]
  );
  assert!(ws.root.join("marker.out").exists());
}

#[tokio::test]
async fn around_hook_may_suppress_the_inner_recipe() {
  let ws = Workspace::new();

  let around: AroundHook = Arc::new(|_job, _proceed| Box::pin(async { Ok(()) }));
  let recipe = WrapperRecipe::new(Arc::new(CommandRecipe::shell("touch marker.out"))).around(around);

  run_rule(&ws, recipe).await;
  // The continuation was dropped, so the command never ran.
  assert!(!ws.root.join("marker.out").exists());
}

#[tokio::test]
async fn recipe_env_is_visible_to_the_command() {
  let ws = Workspace::new();

  let recipe = CommandRecipe::new(|plan| {
    plan.shell("printf '%s' \"$GIRDER_MARK\" > marker.out")?;
    plan.env("GIRDER_MARK", "present");
    Ok(())
  });

  run_rule(&ws, recipe).await;
  assert_eq!(
    std::fs::read_to_string(ws.root.join("marker.out")).unwrap(),
    "present"
  );
}
