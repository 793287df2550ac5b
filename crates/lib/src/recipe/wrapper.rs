//! A recipe wrapper for cross-cutting concerns.
//!
//! `WrapperRecipe` runs optional `before`/`around`/`after` hooks around
//! an inner recipe without altering the inner recipe's own spec hash.
//! An `around` hook receives a `proceed` continuation — the inner
//! execution as a future — which it may await, or drop to suppress
//! execution entirely.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::build::Build;
use crate::job::Job;

use super::{Recipe, RecipeContext, RecipeError, RecipeSpec};

/// A `before`/`after` hook.
pub type Hook = Arc<dyn Fn(Arc<Job>) -> BoxFuture<'static, Result<(), RecipeError>> + Send + Sync>;

/// The continuation handed to an `around` hook: awaiting it runs the
/// inner recipe.
pub type Proceed = BoxFuture<'static, Result<(), RecipeError>>;

/// An `around` hook: receives the job and the `proceed` continuation.
pub type AroundHook = Arc<dyn Fn(Arc<Job>, Proceed) -> BoxFuture<'static, Result<(), RecipeError>> + Send + Sync>;

pub struct WrapperRecipe {
  inner: Arc<dyn Recipe>,
  before: Option<Hook>,
  around: Option<AroundHook>,
  after: Option<Hook>,
}

impl WrapperRecipe {
  pub fn new(inner: Arc<dyn Recipe>) -> Self {
    Self {
      inner,
      before: None,
      around: None,
      after: None,
    }
  }

  pub fn before(mut self, hook: Hook) -> Self {
    self.before = Some(hook);
    self
  }

  pub fn around(mut self, hook: AroundHook) -> Self {
    self.around = Some(hook);
    self
  }

  pub fn after(mut self, hook: Hook) -> Self {
    self.after = Some(hook);
    self
  }
}

#[async_trait]
impl Recipe for WrapperRecipe {
  fn concretize(&self, ctx: &RecipeContext<'_>) -> Result<RecipeSpec, RecipeError> {
    self.inner.concretize(ctx)
  }

  async fn execute(&self, job: &Arc<Job>, build: &Arc<Build>, spec: &RecipeSpec) -> Result<(), RecipeError> {
    if let Some(before) = &self.before {
      before(job.clone()).await?;
    }

    match &self.around {
      Some(around) => {
        let inner = self.inner.clone();
        let proceed_job = job.clone();
        let proceed_build = build.clone();
        let proceed_spec = spec.clone();
        let proceed: Proceed = Box::pin(async move {
          inner.execute(&proceed_job, &proceed_build, &proceed_spec).await
        });
        around(job.clone(), proceed).await?;
      }
      None => {
        self.inner.execute(job, build, spec).await?;
      }
    }

    if let Some(after) = &self.after {
      after(job.clone()).await?;
    }

    Ok(())
  }
}
