//! Batched asynchronous matching and execution.
//!
//! Rules that match or execute sub-targets from inside their own match
//! phase must issue the whole batch first and only then wait, or two
//! targets matching each other's prerequisites can deadlock. The batch
//! objects make that discipline explicit: `submit` spawns work on the
//! runtime, `join` awaits the whole batch without holding any lock of the
//! caller's, and finalization walks the results one by one in submission
//! order.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::Engine;
use crate::error::BuildError;
use crate::graph::Target;
use crate::{Operation, TargetState};

/// A batch of asynchronous target matches.
pub struct MatchBatch {
    engine: Arc<Engine>,
    op: Operation,
    seq: u64,
    group: Option<Arc<Target>>,
    handles: Vec<(Arc<Target>, JoinHandle<Result<(), BuildError>>)>,
}

impl MatchBatch {
    pub fn new(engine: &Arc<Engine>, op: Operation, seq: u64) -> MatchBatch {
        MatchBatch {
            engine: engine.clone(),
            op,
            seq,
            group: None,
            handles: Vec::new(),
        }
    }

    /// A batch matching members on behalf of their owning aggregate;
    /// the member-reachability check admits this group.
    pub fn for_group(
        engine: &Arc<Engine>,
        op: Operation,
        seq: u64,
        group: &Arc<Target>,
    ) -> MatchBatch {
        MatchBatch {
            engine: engine.clone(),
            op,
            seq,
            group: Some(group.clone()),
            handles: Vec::new(),
        }
    }

    pub fn submit(&mut self, target: &Arc<Target>) {
        let engine = self.engine.clone();
        let target2 = target.clone();
        let group = self.group.clone();
        let (op, seq) = (self.op, self.seq);

        let handle = tokio::spawn(async move {
            engine
                .match_target_for(op, seq, &target2, group.as_ref())
                .await
        });
        self.handles.push((target.clone(), handle));
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Await every submitted match. Always drains the whole batch, even
    /// past failures, so no task is left dangling.
    pub async fn join(self) -> MatchResults {
        let mut results = Vec::with_capacity(self.handles.len());
        for (target, handle) in self.handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(BuildError::Worker(e.to_string())),
            };
            results.push((target, result));
        }
        MatchResults { results }
    }
}

/// Results of a joined match batch, finalized one target at a time.
pub struct MatchResults {
    results: Vec<(Arc<Target>, Result<(), BuildError>)>,
}

impl MatchResults {
    /// Complete each match in submission order; the first failure is
    /// returned after the rest have been logged.
    pub fn finalize(self) -> Result<(), BuildError> {
        let mut first: Option<BuildError> = None;
        for (target, result) in self.results {
            if let Err(e) = result {
                debug!(target = %target, error = %e, "match failed");
                first.get_or_insert(e);
            }
        }
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// A batch of asynchronous target executions. Submission order is the
/// completion order: results are merged in the order targets were
/// submitted, so callers control forward/reverse execution by submitting
/// accordingly.
pub struct ExecBatch {
    engine: Arc<Engine>,
    op: Operation,
    seq: u64,
    handles: Vec<(Arc<Target>, JoinHandle<Result<TargetState, BuildError>>)>,
}

impl ExecBatch {
    pub fn new(engine: &Arc<Engine>, op: Operation, seq: u64) -> ExecBatch {
        ExecBatch {
            engine: engine.clone(),
            op,
            seq,
            handles: Vec::new(),
        }
    }

    pub fn submit(&mut self, target: &Arc<Target>) {
        let engine = self.engine.clone();
        let target2 = target.clone();
        let (op, seq) = (self.op, self.seq);

        let handle =
            tokio::spawn(async move { engine.execute_target(op, seq, &target2).await });
        self.handles.push((target.clone(), handle));
    }

    pub async fn join(self) -> ExecResults {
        let mut results = Vec::with_capacity(self.handles.len());
        for (target, handle) in self.handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(BuildError::Worker(e.to_string())),
            };
            results.push((target, result));
        }
        ExecResults { results }
    }
}

pub struct ExecResults {
    results: Vec<(Arc<Target>, Result<TargetState, BuildError>)>,
}

impl ExecResults {
    /// Merge the individual states in submission order. The first failure
    /// wins; siblings that succeeded stay succeeded (their outputs are
    /// not rolled back).
    pub fn merge(self) -> Result<TargetState, BuildError> {
        let mut merged = TargetState::Unchanged;
        let mut first: Option<BuildError> = None;
        for (target, result) in self.results {
            match result {
                Ok(state) => merged = merged.merge(state),
                Err(e) => {
                    debug!(target = %target, error = %e, "execution failed");
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            None => Ok(merged),
            Some(e) => Err(e),
        }
    }
}
