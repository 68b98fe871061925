//! Fallback chain executor.
//!
//! Generic escalation for stages with multiple strategies of decreasing
//! resource cost: try the first, on failure log and try the next, until
//! one succeeds or the chain is exhausted. Each strategy must be
//! independent; output paths use overwrite semantics so a failed attempt
//! cannot corrupt the next one. Reaping a stale external process left by
//! an abandoned attempt is the strategy implementation's concern.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::{StageError, StageResult};
use super::stage::{StageContext, StageOperation};

/// Ordered list of alternative strategies for one stage.
///
/// The chain is itself a `StageOperation`, so a stage with fallbacks
/// registers exactly like a single-strategy stage.
pub struct FallbackChain {
    /// Stage name the chain serves.
    stage: String,
    /// Strategies in escalation order.
    strategies: Vec<Arc<dyn StageOperation>>,
}

impl FallbackChain {
    /// Create an empty chain for the given stage name.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            strategies: Vec::new(),
        }
    }

    /// Append a strategy (builder pattern).
    pub fn with_strategy(mut self, strategy: Arc<dyn StageOperation>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Append a strategy.
    pub fn push(&mut self, strategy: Arc<dyn StageOperation>) {
        self.strategies.push(strategy);
    }

    /// Number of strategies in the chain.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Check if the chain has no strategies.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[async_trait]
impl StageOperation for FallbackChain {
    fn name(&self) -> &str {
        &self.stage
    }

    async fn run(&self, ctx: &StageContext) -> StageResult<serde_json::Value> {
        let mut last_error: Option<StageError> = None;

        for (attempt, strategy) in self.strategies.iter().enumerate() {
            if attempt > 0 {
                ctx.logger.warn(&format!(
                    "Escalating to fallback strategy '{}' ({}/{})",
                    strategy.name(),
                    attempt + 1,
                    self.strategies.len()
                ));
            }

            match strategy.run(ctx).await {
                Ok(details) => {
                    if attempt > 0 {
                        ctx.logger.success(&format!(
                            "Strategy '{}' succeeded after {} failed attempt(s)",
                            strategy.name(),
                            attempt
                        ));
                    }
                    return Ok(details);
                }
                Err(e) => {
                    tracing::warn!(
                        "Strategy '{}' for stage '{}' failed: {}",
                        strategy.name(),
                        self.stage,
                        e
                    );
                    ctx.logger
                        .warn(&format!("Strategy '{}' failed: {}", strategy.name(), e));
                    last_error = Some(e);
                }
            }
        }

        Err(StageError::Exhausted {
            stage: self.stage.clone(),
            attempts: self.strategies.len(),
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no strategies configured".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::stages::FnStage;
    use crate::orchestrator::test_support::stage_context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing(name: &'static str) -> Arc<dyn StageOperation> {
        Arc::new(FnStage::new(name, |_ctx| async {
            Err(StageError::other("strategy failed"))
        }))
    }

    #[tokio::test]
    async fn first_success_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let chain = FallbackChain::new("transcode")
            .with_strategy(Arc::new(FnStage::new("chunked", move |_ctx| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!({"mode": "chunked"}))
                }
            })))
            .with_strategy(failing("single_pass"));

        let (ctx, _dir) = stage_context("job-1", &["transcode"]);
        let details = chain.run(&ctx).await.unwrap();

        assert_eq!(details["mode"], "chunked");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn escalates_until_a_strategy_succeeds() {
        let chain = FallbackChain::new("transcode")
            .with_strategy(failing("chunked"))
            .with_strategy(failing("single_pass"))
            .with_strategy(Arc::new(FnStage::new("minimal", |_ctx| async {
                Ok(serde_json::json!({"mode": "minimal"}))
            })));

        let (ctx, _dir) = stage_context("job-1", &["transcode"]);
        let details = chain.run(&ctx).await.unwrap();

        assert_eq!(details["mode"], "minimal");
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let chain = FallbackChain::new("synthesize")
            .with_strategy(failing("premium"))
            .with_strategy(Arc::new(FnStage::new("basic", |_ctx| async {
                Err(StageError::command_failed("tts-engine", 137, "killed"))
            })));

        let (ctx, _dir) = stage_context("job-1", &["synthesize"]);
        let err = chain.run(&ctx).await.unwrap_err();

        match err {
            StageError::Exhausted {
                stage,
                attempts,
                last_error,
            } => {
                assert_eq!(stage, "synthesize");
                assert_eq!(attempts, 2);
                assert!(last_error.contains("tts-engine"));
                assert!(last_error.contains("137"));
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_chain_is_exhausted_with_zero_attempts() {
        let chain = FallbackChain::new("composite");
        let (ctx, _dir) = stage_context("job-1", &["composite"]);

        let err = chain.run(&ctx).await.unwrap_err();
        assert!(matches!(err, StageError::Exhausted { attempts: 0, .. }));
    }
}
