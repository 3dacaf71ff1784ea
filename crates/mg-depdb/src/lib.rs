//! Per-output dependency ledgers for incremental rebuild decisions.
//!
//! A ledger is a small line-oriented file attached 1:1 to a generated
//! artifact. It records everything that went into producing the artifact
//! (rule identity, tool checksum, option hashes, input and auxiliary
//! dependency paths) so that the next build can answer "is this output
//! stale" by comparing a handful of lines instead of re-deriving the whole
//! dependency closure.
//!
//! ## Format
//!
//! One value per line, starting with a rule identity/version stamp and
//! terminated by exactly one blank line:
//!
//! ```text
//! moc.automoc 1
//! 1 /tmp/proj/widget.hxx
//! 0 /tmp/proj/plain.hxx
//!
//! ```
//!
//! The terminating blank line doubles as a completeness marker: a ledger
//! without it was interrupted mid-write and is discarded wholesale.
//!
//! ## Modes
//!
//! A ledger opens in *lookup* mode when a complete file exists, otherwise
//! in *write* mode. [`Depdb::expect`] and [`Depdb::read`] consume stored
//! lines in lookup mode; the first deviation (mismatched line, missing
//! line, or an explicit [`Depdb::write`]) switches the ledger permanently
//! to write mode, keeping every line validated so far and overwriting from
//! the point of deviation. There is no way back: once any stored value has
//! proven stale, the remainder of the file cannot be trusted.
//!
//! Only one ledger instance per output path may be open for writing at a
//! time; the engine's per-target locking guarantees this.

use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum DepdbError {
    #[error("failed to read dependency ledger {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write dependency ledger {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("dependency ledger {ledger} is newer than output {output}: unreliable filesystem timestamps")]
    ClockSkew {
        ledger: Utf8PathBuf,
        output: Utf8PathBuf,
    },
}

/// What [`Depdb::expect`] found in place of the expected line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// The ledger had no more stored lines.
    Missing,
    /// The ledger had a different value at this position.
    Found(String),
}

/// State needed to resume writing a ledger that was closed during the
/// match phase and is appended to during execution (see the compile
/// rules: header lines are verified in apply, auxiliary dependency paths
/// are appended in perform).
#[derive(Debug)]
pub struct ReopenState {
    path: Utf8PathBuf,
    lines: Vec<String>,
}

impl ReopenState {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[derive(Debug)]
pub struct Depdb {
    path: Utf8PathBuf,
    /// Lines of the existing ledger, terminator excluded. Empty if the
    /// ledger opened straight in write mode.
    old_lines: Vec<String>,
    /// Index of the next stored line to read or compare.
    pos: usize,
    /// Position of the last line handed out by `read` and not yet
    /// superseded by another operation. A deviation reported after a read
    /// overwrites that line, not the one after it.
    pending: Option<usize>,
    writing: bool,
    /// Validated prefix plus newly written lines; meaningful once
    /// `writing` is true.
    content: Vec<String>,
    mtime: Option<SystemTime>,
}

impl Depdb {
    /// Open the ledger at `path`: lookup mode if a complete ledger exists,
    /// write mode otherwise. An incomplete file (missing terminator) is
    /// treated as absent; the rebuild it forces is the recovery path, not
    /// an error.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Depdb, DepdbError> {
        let path = path.into();

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(ledger = %path, "no dependency ledger, starting fresh");
                return Ok(Depdb::fresh(path));
            }
            Err(source) => return Err(DepdbError::Read { path, source }),
        };

        // A complete ledger ends with a real line's newline followed by
        // the blank terminator line's newline.
        if !text.ends_with("\n\n") {
            trace!(ledger = %path, "incomplete dependency ledger, discarding");
            return Ok(Depdb::fresh(path));
        }

        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|source| DepdbError::Stat {
                path: path.clone(),
                source,
            })?;

        let old_lines = text[..text.len() - 1].lines().map(str::to_owned).collect();

        Ok(Depdb {
            path,
            old_lines,
            pos: 0,
            pending: None,
            writing: false,
            content: Vec::new(),
            mtime: Some(mtime),
        })
    }

    fn fresh(path: Utf8PathBuf) -> Depdb {
        Depdb {
            path,
            old_lines: Vec::new(),
            pos: 0,
            pending: None,
            writing: true,
            content: Vec::new(),
            mtime: None,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// True once any deviation has been found and the ledger will be
    /// rewritten on close.
    pub fn writing(&self) -> bool {
        self.writing
    }

    /// Modification time of the ledger as opened; `None` in write mode.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    fn start_write_at(&mut self, at: usize) {
        if !self.writing {
            self.writing = true;
            self.content = self.old_lines[..at].to_vec();
        }
    }

    /// Compare the next stored line to `value`. On a match the line is
    /// consumed and `None` is returned; on a mismatch (or at end of
    /// stored lines) the ledger switches to write mode, `value` is
    /// recorded, and the stale value is returned for diagnostics.
    pub fn expect(&mut self, value: &str) -> Option<Mismatch> {
        if self.writing {
            self.pending = None;
            self.content.push(value.to_owned());
            return None;
        }

        match self.old_lines.get(self.pos).cloned() {
            Some(line) if line == value => {
                self.pos += 1;
                self.pending = None;
                None
            }
            Some(line) => {
                let at = self.pending.take().unwrap_or(self.pos);
                self.start_write_at(at);
                self.content.push(value.to_owned());
                Some(Mismatch::Found(line))
            }
            None => {
                let at = self.pending.take().unwrap_or(self.pos);
                self.start_write_at(at);
                self.content.push(value.to_owned());
                Some(Mismatch::Missing)
            }
        }
    }

    /// Read the next stored line, or `None` at the end of the stored
    /// lines. Only meaningful in lookup mode. If the caller then decides
    /// the line is stale, a subsequent [`write`](Depdb::write) or
    /// [`invalidate`](Depdb::invalidate) overwrites this line rather than
    /// the one after it.
    pub fn read(&mut self) -> Option<&str> {
        if self.writing || self.pos >= self.old_lines.len() {
            return None;
        }

        self.pending = Some(self.pos);
        self.pos += 1;
        Some(&self.old_lines[self.pos - 1])
    }

    /// Append a line, switching permanently to write mode if not there
    /// already.
    pub fn write(&mut self, line: &str) {
        debug_assert!(!line.contains('\n'));

        let at = self.pending.take().unwrap_or(self.pos);
        self.start_write_at(at);
        self.content.push(line.to_owned());
    }

    /// Switch to write mode without recording a replacement line,
    /// discarding the last read line (if any) and everything after it.
    pub fn invalidate(&mut self) {
        let at = self.pending.take().unwrap_or(self.pos);
        self.start_write_at(at);
    }

    /// Finalize the ledger. In write mode the validated prefix plus all
    /// written lines are persisted with the blank terminator. In lookup
    /// mode a leftover stored tail (entries no longer matched by any
    /// input) counts as a deviation: the file is truncated to the
    /// validated prefix. A fully consumed lookup-mode ledger is left
    /// untouched so its modification time stays meaningful.
    pub fn close(mut self) -> Result<(), DepdbError> {
        if !self.writing {
            if self.pos == self.old_lines.len() {
                return Ok(());
            }

            trace!(
                ledger = %self.path,
                stale = self.old_lines.len() - self.pos,
                "dropping stale dependency ledger tail"
            );
            // Lines the caller read without objecting to are kept.
            let at = self.pos;
            self.start_write_at(at);
        }

        self.persist()
    }

    /// Finalize the in-memory state but keep the validated content so the
    /// ledger can be reopened for appending during execution. Nothing is
    /// written to disk until the reopened ledger is closed.
    pub fn close_to_reopen(mut self) -> ReopenState {
        let lines = if self.writing {
            std::mem::take(&mut self.content)
        } else {
            // Everything read so far was accepted (a rejected line would
            // have switched us to write mode); keep it all.
            self.old_lines[..self.pos].to_vec()
        };

        ReopenState {
            path: std::mem::take(&mut self.path),
            lines,
        }
    }

    /// Resume a ledger from [`close_to_reopen`](Depdb::close_to_reopen),
    /// in write mode, positioned after the validated content.
    pub fn reopen(state: ReopenState) -> Depdb {
        Depdb {
            path: state.path,
            old_lines: Vec::new(),
            pos: 0,
            pending: None,
            writing: true,
            content: state.lines,
            mtime: None,
        }
    }

    fn persist(&self) -> Result<(), DepdbError> {
        let mut text = String::new();
        for line in &self.content {
            text.push_str(line);
            text.push('\n');
        }
        text.push('\n');

        std::fs::write(&self.path, text).map_err(|source| DepdbError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Verify that the ledger at `ledger` is not newer than the output it
/// describes. A ledger that postdates its output signals an unreliable
/// timestamp source (clock skew, an out-of-band writer) and makes every
/// subsequent staleness decision meaningless, so this is fatal.
pub fn check_mtime(ledger: &Utf8Path, output: &Utf8Path) -> Result<(), DepdbError> {
    let stat = |path: &Utf8Path| -> Result<SystemTime, DepdbError> {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|source| DepdbError::Stat {
                path: path.to_owned(),
                source,
            })
    };

    let lt = stat(ledger)?;
    let ot = stat(output)?;

    if lt > ot {
        return Err(DepdbError::ClockSkew {
            ledger: ledger.to_owned(),
            output: output.to_owned(),
        });
    }

    Ok(())
}

/// Ledger reconciliation mode for rules that walk stored entries in
/// lock-step with a sorted input set. The transition is one-way: once any
/// entry deviates, every remaining input is scanned rather than looked
/// up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Stored entries are still trusted; inputs are compared against them.
    Lookup,
    /// A deviation was found; all remaining inputs are scanned afresh.
    Scan,
}

impl Reconcile {
    /// Record a deviation. Idempotent; there is no transition back.
    pub fn on_deviation(&mut self) {
        *self = Reconcile::Scan;
    }

    pub fn is_scan(self) -> bool {
        matches!(self, Reconcile::Scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger_path(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("out.d")).unwrap()
    }

    #[test]
    fn missing_file_opens_in_write_mode() {
        let dir = TempDir::new().unwrap();
        let dd = Depdb::open(ledger_path(&dir)).unwrap();

        assert!(dd.writing());
        assert_eq!(dd.mtime(), None);
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        dd.write("rule 1");
        dd.write("1 /tmp/a.hxx");
        dd.write("0 /tmp/b.hxx");
        dd.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "rule 1\n1 /tmp/a.hxx\n0 /tmp/b.hxx\n\n");

        let mut dd = Depdb::open(path).unwrap();
        assert!(!dd.writing());
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.read(), Some("1 /tmp/a.hxx"));
        assert_eq!(dd.read(), Some("0 /tmp/b.hxx"));
        assert_eq!(dd.read(), None);
        dd.close().unwrap();
    }

    #[test]
    fn expect_mismatch_switches_to_write_and_reports_stale_value() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        dd.write("rule 1");
        dd.write("payload");
        dd.close().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(
            dd.expect("rule 2"),
            Some(Mismatch::Found("rule 1".to_owned()))
        );
        assert!(dd.writing());
        // Stored lines past the deviation are gone.
        assert_eq!(dd.read(), None);
        dd.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "rule 2\n\n");
    }

    #[test]
    fn expect_past_end_reports_missing() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        dd.write("rule 1");
        dd.close().unwrap();

        let mut dd = Depdb::open(path).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.expect("extra"), Some(Mismatch::Missing));
        assert!(dd.writing());
    }

    #[test]
    fn write_after_read_overwrites_the_read_line() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        for line in ["rule 1", "keep", "stale", "dropped"] {
            dd.write(line);
        }
        dd.close().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.read(), Some("keep"));
        assert_eq!(dd.read(), Some("stale"));
        // The caller decided "stale" deviated; the replacement must land
        // where "stale" was, keeping "keep".
        dd.write("fresh");
        dd.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "rule 1\nkeep\nfresh\n\n"
        );
    }

    #[test]
    fn invalidate_discards_the_read_line() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        for line in ["rule 1", "keep", "gone"] {
            dd.write(line);
        }
        dd.close().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.read(), Some("keep"));
        assert_eq!(dd.read(), Some("gone"));
        dd.invalidate();
        dd.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "rule 1\nkeep\n\n");
    }

    #[test]
    fn stale_tail_is_truncated_on_close() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        for line in ["rule 1", "a", "b", "c"] {
            dd.write(line);
        }
        dd.close().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.read(), Some("a"));
        dd.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "rule 1\na\n\n");
    }

    #[test]
    fn clean_lookup_close_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        dd.write("rule 1");
        dd.write("a");
        dd.close().unwrap();

        let before = std::fs::metadata(path.as_std_path()).unwrap().modified().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.read(), Some("a"));
        assert_eq!(dd.read(), None);
        dd.close().unwrap();

        let after = std::fs::metadata(path.as_std_path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn incomplete_ledger_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        std::fs::write(&path, "rule 1\n1 /tmp/a.hxx\n").unwrap();

        let dd = Depdb::open(path).unwrap();
        assert!(dd.writing());
    }

    #[test]
    fn close_to_reopen_appends_after_validated_prefix() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        let mut dd = Depdb::open(path.clone()).unwrap();
        for line in ["rule 1", "input", "aux-old"] {
            dd.write(line);
        }
        dd.close().unwrap();

        let mut dd = Depdb::open(path.clone()).unwrap();
        assert_eq!(dd.expect("rule 1"), None);
        assert_eq!(dd.expect("input"), None);
        let state = dd.close_to_reopen();

        let mut dd = Depdb::reopen(state);
        dd.write("aux-new");
        dd.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "rule 1\ninput\naux-new\n\n"
        );
    }

    #[test]
    fn check_mtime_detects_skew() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        let out = Utf8PathBuf::from_path_buf(dir.path().join("out.cxx")).unwrap();

        std::fs::write(&out, "generated").unwrap();

        // Ledger written after the output: the output's timestamp can no
        // longer order future rebuild decisions.
        let old = SystemTime::now() - std::time::Duration::from_secs(60);
        let mut dd = Depdb::open(path.clone()).unwrap();
        dd.write("rule 1");
        dd.close().unwrap();

        filetime_set(&out, old);
        assert!(check_mtime(&path, &out).is_err());

        filetime_set(&out, SystemTime::now() + std::time::Duration::from_secs(60));
        assert!(check_mtime(&path, &out).is_ok());
    }

    #[test]
    fn reconcile_transition_is_one_way() {
        let mut r = Reconcile::Lookup;
        assert!(!r.is_scan());
        r.on_deviation();
        assert!(r.is_scan());
        r.on_deviation();
        assert!(r.is_scan());
    }

    fn filetime_set(path: &Utf8Path, t: SystemTime) {
        let f = std::fs::File::options()
            .write(true)
            .open(path.as_std_path())
            .unwrap();
        f.set_modified(t).unwrap();
    }
}
