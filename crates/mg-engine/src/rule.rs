//! The rule interface: match, apply, and the recipes they produce.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::engine::Engine;
use crate::error::BuildError;
use crate::graph::Target;
use crate::{Operation, TargetState};

/// The future a recipe's perform step returns.
pub type PerformFuture = BoxFuture<'static, Result<TargetState, BuildError>>;

/// The perform step of a matched recipe. Consumed on execution; a target
/// executes at most once per operation.
pub type PerformFn = Box<dyn FnOnce(Arc<Engine>, Arc<Target>) -> PerformFuture + Send>;

/// What a rule's apply step hands back to the engine.
pub enum Recipe {
    /// Nothing to do at execute time; the target reports `Unchanged`.
    Noop,
    /// Run this at execute time.
    Perform(PerformFn),
}

impl Recipe {
    /// Wrap an async perform function.
    pub fn perform<F, Fut>(f: F) -> Recipe
    where
        F: FnOnce(Arc<Engine>, Arc<Target>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TargetState, BuildError>> + Send + 'static,
    {
        Recipe::Perform(Box::new(move |engine, target| Box::pin(f(engine, target))))
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipe::Noop => f.write_str("Recipe::Noop"),
            Recipe::Perform(_) => f.write_str("Recipe::Perform(..)"),
        }
    }
}

/// Context handed to a rule's apply step.
#[derive(Clone, Copy)]
pub struct MatchContext<'a> {
    pub engine: &'a Arc<Engine>,
    pub op: Operation,
    /// Invocation sequence number; stamps per-operation state.
    pub seq: u64,
}

/// A build rule.
///
/// `matches` is a cheap applicability test over the target and its
/// declared prerequisites; `apply` does the real work of the match phase
/// (resolving and matching prerequisites, consulting ledgers, mutating
/// the graph for aggregates) and returns the recipe to run at execute
/// time. Rules are consulted in registration order; the first match wins.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, op: Operation, target: &Target) -> bool;

    fn apply<'a>(
        &'a self,
        cx: MatchContext<'a>,
        target: &'a Arc<Target>,
    ) -> BoxFuture<'a, Result<Recipe, BuildError>>;
}

/// Fallback rule for plain files: sources, headers, resources, libraries.
/// Matching verifies existence for file inputs (a missing input is an
/// error at match time, not execute time); the recipe is a no-op.
pub struct FileRule;

impl Rule for FileRule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn matches(&self, _op: Operation, target: &Target) -> bool {
        target.kind != crate::FileKind::AutomocGroup
    }

    fn apply<'a>(
        &'a self,
        cx: MatchContext<'a>,
        target: &'a Arc<Target>,
    ) -> BoxFuture<'a, Result<Recipe, BuildError>> {
        Box::pin(async move {
            // Library targets may be pure metadata carriers; existence is
            // a linker concern, not ours.
            if cx.op == Operation::Update && !target.kind.is_lib() && target.mtime().is_none() {
                return Err(BuildError::MissingInput(target.path()));
            }
            Ok(Recipe::Noop)
        })
    }
}
