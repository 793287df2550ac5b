//! A recipe wrapper that time-shifts execution.
//!
//! `DelayedRecipe` reuses the wrapped recipe's concretized spec and hash
//! unchanged — the delay is an execution concern, not part of the
//! recipe's identity — and sleeps for a fixed duration before invoking
//! the inner recipe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::build::Build;
use crate::job::Job;

use super::{Recipe, RecipeContext, RecipeError, RecipeSpec};

pub struct DelayedRecipe {
  inner: Arc<dyn Recipe>,
  delay: Duration,
}

impl DelayedRecipe {
  pub fn new(inner: Arc<dyn Recipe>, delay: Duration) -> Self {
    Self { inner, delay }
  }

  pub fn delay(&self) -> Duration {
    self.delay
  }
}

#[async_trait]
impl Recipe for DelayedRecipe {
  fn concretize(&self, ctx: &RecipeContext<'_>) -> Result<RecipeSpec, RecipeError> {
    self.inner.concretize(ctx)
  }

  async fn execute(&self, job: &Arc<Job>, build: &Arc<Build>, spec: &RecipeSpec) -> Result<(), RecipeError> {
    debug!(rule = %job.rule().label(), delay_ms = self.delay.as_millis() as u64, "delaying recipe");
    tokio::time::sleep(self.delay).await;
    self.inner.execute(job, build, spec).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::ArtifactManager;
  use crate::graph::{Graph, Rule};
  use crate::recipe::CommandRecipe;

  #[test]
  fn delayed_recipe_shares_the_inner_spec_hash() {
    let mut graph = Graph::new();
    let rule = graph.add_rule(Rule::builder("slow")).unwrap();
    let manager = Arc::new(ArtifactManager::new("/ws"));
    let ctx = RecipeContext::new(&rule, &manager);

    let inner = Arc::new(CommandRecipe::shell("echo hi"));
    let delayed = DelayedRecipe::new(inner.clone(), Duration::from_millis(50));

    let inner_spec = inner.concretize(&ctx).unwrap();
    let delayed_spec = delayed.concretize(&ctx).unwrap();

    assert_eq!(
      inner_spec.spec_hash().unwrap(),
      delayed_spec.spec_hash().unwrap()
    );
  }
}
