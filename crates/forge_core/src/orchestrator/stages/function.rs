//! Async closure adapter for stage operations.

use std::future::Future;

use async_trait::async_trait;

use crate::orchestrator::errors::StageResult;
use crate::orchestrator::stage::{StageContext, StageOperation};

/// Stage operation backed by an async closure.
///
/// The closure receives the stage context by reference and must return an
/// owned future, so anything it needs across an await point is cloned out
/// of the context first:
///
/// ```ignore
/// FnStage::new("transcribe", |ctx| {
///     let input = ctx.work_dir.join("audio.wav");
///     async move { transcribe(&input).await }
/// })
/// ```
pub struct FnStage<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnStage<F>
where
    F: Fn(&StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult<serde_json::Value>> + Send + 'static,
{
    /// Create a stage operation from a closure.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> StageOperation for FnStage<F>
where
    F: Fn(&StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult<serde_json::Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> StageResult<serde_json::Value> {
        (self.func)(ctx).await
    }
}
