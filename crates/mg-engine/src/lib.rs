//! Build-engine collaborator surface for the margay code-generator rules.
//!
//! This crate provides the slice of a general-purpose build engine that the
//! rules in `mg-rules` are written against: a target/prerequisite graph
//! with typed nodes, a match/apply/execute per-target state machine with
//! asynchronous batch matching, process spawning, and build-wide variable
//! lookup. It is deliberately minimal — just enough engine for the rules
//! to run and be tested — but the contracts (per-target locking,
//! operation-stamped state, issue-batch/join/finalize matching) are the
//! ones the rules rely on.

pub mod batch;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod graph;
pub mod process;
pub mod rule;
pub mod vars;

pub use batch::{ExecBatch, MatchBatch};
pub use engine::Engine;
pub use error::BuildError;
pub use graph::{FileKind, Graph, Include, Prerequisite, Target};
pub use rule::{MatchContext, Recipe, Rule};
pub use vars::{Value, Vars};

/// A build operation. Each invocation of the engine performs exactly one
/// operation over a set of root targets; per-target state (match results,
/// discovered group members) is stamped with the operation and invocation
/// and is not carried across either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Bring targets up to date.
    Update,
    /// Remove generated outputs and their ledgers.
    Clean,
    /// Prepare the graph without performing any work (configure-style
    /// passes over the graph).
    ConfigureUpdate,
}

impl Operation {
    /// The order in which sibling targets are executed. Clean runs in
    /// reverse so that outputs disappear before the things they were
    /// generated from.
    pub fn execution_mode(self) -> ExecutionMode {
        match self {
            Operation::Clean => ExecutionMode::Reverse,
            _ => ExecutionMode::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Forward,
    Reverse,
}

/// Result of executing a target (or a merged set of targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unchanged,
    Changed,
}

impl TargetState {
    pub fn merge(self, other: TargetState) -> TargetState {
        if self == TargetState::Changed || other == TargetState::Changed {
            TargetState::Changed
        } else {
            TargetState::Unchanged
        }
    }
}
