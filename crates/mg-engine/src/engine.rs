//! The per-target match/apply/execute state machine.
//!
//! One [`Engine`] spans one build invocation. Each call to [`Engine::run`]
//! performs one operation: it bumps the invocation sequence, matches the
//! root targets (rules may mutate the graph and match further targets
//! from inside their apply step), then executes the roots in the
//! operation's declared order and merges their states.
//!
//! Per-target state is single-flight: concurrent attempts to match or
//! execute the same target serialize on the target's slot, and the loser
//! observes the winner's result instead of repeating the work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, trace};

use crate::batch::{ExecBatch, MatchBatch};
use crate::error::BuildError;
use crate::graph::{Graph, Target};
use crate::rule::{FileRule, MatchContext, Recipe, Rule};
use crate::vars::Vars;
use crate::{ExecutionMode, Operation, TargetState};

/// Match result stored on a target, stamped with the operation and
/// invocation it is valid for.
pub(crate) struct Matched {
    pub op: Operation,
    pub seq: u64,
    pub rule: &'static str,
    /// Taken (once) by the executor.
    pub recipe: Option<Recipe>,
}

/// Execution result stored on a target.
pub(crate) struct Executed {
    pub op: Operation,
    pub seq: u64,
    pub state: TargetState,
}

pub struct EngineConfig {
    /// Skip running generator processes and rewriting ledgers; staleness
    /// decisions still happen.
    pub dry_run: bool,
    /// 0 = quiet, 1 = one-line action summaries, 2 = full command lines.
    pub verbosity: u8,
    /// Bound on concurrently running generator processes.
    pub jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            dry_run: false,
            verbosity: 1,
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

pub struct Engine {
    pub graph: Graph,
    pub vars: Vars,
    rules: Vec<Arc<dyn Rule>>,
    seq: AtomicU64,
    pub(crate) proc_pool: Semaphore,
    pub dry_run: bool,
    pub verbosity: u8,
}

impl Engine {
    /// Create an engine with the given variables and rule registry. The
    /// fallback existence rule for plain files is appended automatically,
    /// so registered rules always win where they apply.
    pub fn new(vars: Vars, rules: Vec<Arc<dyn Rule>>) -> Arc<Engine> {
        Engine::with_config(vars, rules, EngineConfig::default())
    }

    pub fn with_config(
        vars: Vars,
        mut rules: Vec<Arc<dyn Rule>>,
        config: EngineConfig,
    ) -> Arc<Engine> {
        rules.push(Arc::new(FileRule));

        Arc::new(Engine {
            graph: Graph::new(),
            vars,
            rules,
            seq: AtomicU64::new(0),
            proc_pool: Semaphore::new(config.jobs.max(1)),
            dry_run: config.dry_run,
            verbosity: config.verbosity,
        })
    }

    /// Perform one operation over `roots`: match everything, then execute
    /// in the operation's declared order and merge the states.
    pub async fn run(
        self: &Arc<Self>,
        op: Operation,
        roots: &[Arc<Target>],
    ) -> Result<TargetState, BuildError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        info!(?op, seq, roots = roots.len(), "starting operation");

        let mut matches = MatchBatch::new(self, op, seq);
        for root in roots {
            matches.submit(root);
        }
        matches.join().await.finalize()?;

        let mut execs = ExecBatch::new(self, op, seq);
        match op.execution_mode() {
            ExecutionMode::Forward => {
                for root in roots {
                    execs.submit(root);
                }
            }
            ExecutionMode::Reverse => {
                for root in roots.iter().rev() {
                    execs.submit(root);
                }
            }
        }
        let state = execs.join().await.merge()?;

        info!(?op, seq, ?state, "operation finished");
        Ok(state)
    }

    /// Match a target: pick the first applicable rule and run its apply
    /// step, storing the resulting recipe. Idempotent per
    /// `(operation, invocation)`.
    pub async fn match_target(
        self: &Arc<Self>,
        op: Operation,
        seq: u64,
        target: &Arc<Target>,
    ) -> Result<(), BuildError> {
        self.match_target_for(op, seq, target, None).await
    }

    /// Like [`match_target`](Engine::match_target), but on behalf of an
    /// aggregate. A target linked to a group may only be matched through
    /// that group; any other path to it is a configuration error.
    pub async fn match_target_for(
        self: &Arc<Self>,
        op: Operation,
        seq: u64,
        target: &Arc<Target>,
        group: Option<&Arc<Target>>,
    ) -> Result<(), BuildError> {
        let mut slot = target.match_slot.lock().await;
        if let Some(m) = slot.as_ref() {
            if m.op == op && m.seq == seq {
                return Ok(());
            }
        }

        if let Some(owner) = target.group() {
            let via_owner = group.is_some_and(|g| Arc::ptr_eq(g, &owner));
            if !via_owner {
                return Err(BuildError::config(
                    target,
                    format!(
                        "target is a member of {owner} and can only be built through it"
                    ),
                ));
            }
        }

        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(op, target))
            .cloned()
            .ok_or_else(|| BuildError::NoRule(target.to_string()))?;

        trace!(target = %target, rule = rule.name(), "matched");

        let cx = MatchContext {
            engine: self,
            op,
            seq,
        };
        let recipe = rule.apply(cx, target).await?;

        *slot = Some(Matched {
            op,
            seq,
            rule: rule.name(),
            recipe: Some(recipe),
        });
        Ok(())
    }

    /// The name of the rule that matched `target` for `(op, seq)`, if it
    /// has been matched.
    pub async fn matched_rule(
        &self,
        op: Operation,
        seq: u64,
        target: &Arc<Target>,
    ) -> Option<&'static str> {
        let slot = target.match_slot.lock().await;
        match slot.as_ref() {
            Some(m) if m.op == op && m.seq == seq => Some(m.rule),
            _ => None,
        }
    }

    /// Execute a matched target's recipe, at most once per operation.
    /// Later callers observe the stored state.
    pub async fn execute_target(
        self: &Arc<Self>,
        op: Operation,
        seq: u64,
        target: &Arc<Target>,
    ) -> Result<TargetState, BuildError> {
        let mut exec = target.exec_slot.lock().await;
        if let Some(e) = exec.as_ref() {
            if e.op == op && e.seq == seq {
                return Ok(e.state);
            }
        }

        let recipe = {
            let mut slot = target.match_slot.lock().await;
            match slot.as_mut() {
                Some(m) if m.op == op && m.seq == seq => {
                    // A taken recipe with no stored state means a previous
                    // executor failed.
                    m.recipe
                        .take()
                        .ok_or_else(|| BuildError::Failed(target.to_string()))?
                }
                _ => return Err(BuildError::NotMatched(target.to_string())),
            }
        };

        let state = match recipe {
            Recipe::Noop => TargetState::Unchanged,
            Recipe::Perform(f) => {
                debug!(target = %target, "executing");
                f(self.clone(), target.clone()).await?
            }
        };

        *exec = Some(Executed { op, seq, state });
        Ok(state)
    }

    /// Bring already-matched targets up to date during the match phase.
    /// Used for inputs whose contents a rule needs to read before the
    /// execute phase starts.
    pub async fn update_during_match(
        self: &Arc<Self>,
        op: Operation,
        seq: u64,
        targets: &[Arc<Target>],
    ) -> Result<TargetState, BuildError> {
        let mut batch = ExecBatch::new(self, op, seq);
        for t in targets {
            batch.submit(t);
        }
        batch.join().await.merge()
    }
}
