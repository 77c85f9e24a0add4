//! Linear sagas with mechanical rollback.
//!
//! A saga is an ordered list of [`SagaStep`]s sharing a mutable context. When
//! a step fails, the steps that ran are compensated in reverse order, the
//! failed step included since it may have acquired part of its resource.
//! Steps flagged [`compensate_always`](SagaStep::compensate_always) are
//! compensated even when the saga failed before reaching them.

use crate::error::{CoreError, Result};
use async_trait::async_trait;

#[async_trait]
pub trait SagaStep<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut C) -> Result<()>;

    /// Undo what [`execute`](Self::execute) acquired. Must tolerate partial
    /// or missing state and must not fail.
    async fn compensate(&self, _ctx: &mut C) {}

    /// Compensate even if this step never ran.
    fn compensate_always(&self) -> bool {
        false
    }
}

/// Failure of a saga: the step that failed and its error.
#[derive(Debug)]
pub struct SagaFailure {
    pub step: &'static str,
    pub error: CoreError,
}

/// An ordered set of steps over context `C`.
pub struct Saga<C: Send> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Send> Saga<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, rolling back on the first failure.
    ///
    /// The returned error is always the one of the failing step.
    pub async fn run(&self, ctx: &mut C) -> std::result::Result<(), SagaFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            let start = std::time::Instant::now();
            tracing::debug!(saga = self.name, step = step.name(), "Saga step starting");

            if let Err(error) = step.execute(ctx).await {
                tracing::error!(
                    saga = self.name,
                    step = step.name(),
                    error = %error,
                    "Saga step failed, rolling back"
                );
                self.rollback(index, ctx).await;
                return Err(SagaFailure {
                    step: step.name(),
                    error,
                });
            }

            tracing::debug!(
                saga = self.name,
                step = step.name(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Saga step finished"
            );
        }
        Ok(())
    }

    async fn rollback(&self, failed: usize, ctx: &mut C) {
        let not_reached = self.steps[failed + 1..]
            .iter()
            .rev()
            .filter(|s| s.compensate_always());
        let reached = self.steps[..=failed].iter().rev();

        for step in not_reached.chain(reached) {
            tracing::debug!(saga = self.name, step = step.name(), "Compensating");
            step.compensate(ctx).await;
        }
        tracing::warn!(saga = self.name, "Rollback finished");
    }
}
