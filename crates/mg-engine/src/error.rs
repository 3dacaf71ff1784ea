//! Error types shared across the engine and the rules.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that abort a target's build.
///
/// Nothing here is retried: a fatal condition fails the enclosing target
/// and, transitively, anything depending on it, but leaves unrelated
/// sibling targets alone. `Config` errors are the user-actionable class
/// and carry the offending target/prerequisite names in the message.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no rule to build target {0}")]
    NoRule(String),

    #[error("target {0} has not been matched for this operation")]
    NotMatched(String),

    #[error("target {0} failed to build")]
    Failed(String),

    #[error("input file {0} does not exist")]
    MissingInput(Utf8PathBuf),

    #[error("configuration error for {target}: {detail}")]
    Config { target: String, detail: String },

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}")]
    Tool { program: String, code: i32 },

    #[error("invalid dependency file {path}: {detail}")]
    Depfile { path: Utf8PathBuf, detail: String },

    #[error(transparent)]
    Depdb(#[from] mg_depdb::DepdbError),

    #[error(transparent)]
    Scan(#[from] mg_scan::ScanError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl BuildError {
    /// Configuration-error constructor; keeps call sites one line.
    pub fn config(target: impl std::fmt::Display, detail: impl Into<String>) -> BuildError {
        BuildError::Config {
            target: target.to_string(),
            detail: detail.into(),
        }
    }
}
