//! Generator tool handles.

use camino::{Utf8Path, Utf8PathBuf};

use mg_engine::BuildError;

/// An external code generator: where its binary lives and a checksum of
/// that binary. The checksum goes into every output's ledger so that
/// swapping the tool (a toolchain upgrade, a different install) forces
/// regeneration even when nothing else changed.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: &'static str,
    pub program: Utf8PathBuf,
    pub checksum: String,
}

impl Tool {
    /// Create a tool handle, hashing the binary at `program`.
    pub fn from_program(
        name: &'static str,
        program: impl Into<Utf8PathBuf>,
    ) -> Result<Tool, BuildError> {
        let program = program.into();
        let bytes = std::fs::read(&program).map_err(|source| BuildError::Io {
            action: "read",
            path: program.clone(),
            source,
        })?;

        let checksum = hex::encode(blake3::hash(&bytes).as_bytes());

        Ok(Tool {
            name,
            program,
            checksum,
        })
    }

    /// Create a tool handle with a known checksum (e.g. taken from a
    /// toolchain manifest rather than the binary itself).
    pub fn with_checksum(
        name: &'static str,
        program: impl Into<Utf8PathBuf>,
        checksum: impl Into<String>,
    ) -> Tool {
        Tool {
            name,
            program: program.into(),
            checksum: checksum.into(),
        }
    }

    pub fn program(&self) -> &Utf8Path {
        &self.program
    }
}
