//! External process execution and action diagnostics.

use camino::Utf8Path;
use tracing::info;

use crate::engine::Engine;
use crate::error::BuildError;
use crate::graph::Target;

/// Run an external tool, bounded by the engine's process pool. The
/// child inherits stderr so tool diagnostics reach the user verbatim; a
/// non-zero exit is fatal for the calling target.
pub async fn run_process(
    engine: &Engine,
    program: &Utf8Path,
    args: &[String],
    cwd: &Utf8Path,
) -> Result<(), BuildError> {
    let _permit = engine
        .proc_pool
        .acquire()
        .await
        .map_err(|_| BuildError::Worker("process pool closed".to_owned()))?;

    let status = tokio::process::Command::new(program.as_std_path())
        .args(args)
        .current_dir(cwd)
        .status()
        .await
        .map_err(|source| BuildError::Io {
            action: "spawn",
            path: program.to_owned(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::Tool {
            program: program
                .file_name()
                .unwrap_or_else(|| program.as_str())
                .to_owned(),
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Echo the full command line (verbosity >= 2).
pub fn print_process(program: &Utf8Path, args: &[String]) {
    info!("{} {}", program, args.join(" "));
}

/// One-line action summary, `moc header{...} -> meta_source{...}`
/// (verbosity == 1).
pub fn print_diag(engine: &Engine, action: &str, input: &Target, output: &Target) {
    if engine.verbosity == 1 {
        info!("{action} {input} -> {output}");
    }
}
