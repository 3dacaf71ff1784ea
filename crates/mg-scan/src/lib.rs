//! Meta-object marker detection for C/C++ sources.
//!
//! Decides, in one linear pass, whether a header or source file contains
//! one of the meta-object markers (`Q_OBJECT`, `Q_GADGET`, etc.) that make
//! it an input to the meta-object compiler. This is a lexer, not a parser:
//! the file does not have to be valid C++, but a marker only counts as a
//! whole identifier outside comments and string/character literals, so
//! mentioning `Q_OBJECT` in a doc comment does not trigger generation.
//!
//! The scan stops at the first marker found.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::trace;

/// Identifiers whose presence marks a file as needing meta-object code
/// generation.
pub const MARKERS: &[&str] = &[
    "Q_OBJECT",
    "Q_GADGET",
    "Q_GADGET_EXPORT",
    "Q_NAMESPACE",
    "Q_NAMESPACE_EXPORT",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Scan the file at `path` for meta-object markers.
///
/// An unreadable file is an error, never "no markers": silently skipping
/// generation for a file the user declared as an input would produce a
/// build that links without the meta-object symbols it needs.
pub fn scan_file(path: &Utf8Path) -> Result<bool, ScanError> {
    let bytes = std::fs::read(path).map_err(|source| ScanError::Read {
        path: path.to_owned(),
        source,
    })?;

    let found = contains_marker(&bytes);
    trace!(path = %path, found, "scanned for meta-object markers");
    Ok(found)
}

/// Scan raw source text for meta-object markers.
///
/// Takes bytes rather than `str`: the lexical structure that matters here
/// is pure ASCII and source files are not required to be valid UTF-8.
pub fn contains_marker(text: &[u8]) -> bool {
    Lexer { text, pos: 0 }.find_marker()
}

struct Lexer<'a> {
    text: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn find_marker(&mut self) -> bool {
        while self.pos < self.text.len() {
            let b = self.peek();

            if b == b'/' && self.peek_at(1) == b'/' {
                self.skip_line_comment();
            } else if b == b'/' && self.peek_at(1) == b'*' {
                self.skip_block_comment();
            } else if b == b'"' {
                self.skip_string(b'"');
            } else if b == b'\'' {
                self.skip_string(b'\'');
            } else if is_ident_start(b) {
                if self.lex_identifier() {
                    return true;
                }
            } else {
                self.pos += 1;
            }
        }

        false
    }

    fn peek(&self) -> u8 {
        self.text[self.pos]
    }

    fn peek_at(&self, offset: usize) -> u8 {
        *self.text.get(self.pos + offset).unwrap_or(&0)
    }

    fn skip_line_comment(&mut self) {
        // A backslash-newline continues a line comment onto the next line.
        self.pos += 2;
        while self.pos < self.text.len() {
            if self.text[self.pos] == b'\n' && !self.line_continued() {
                break;
            }
            self.pos += 1;
        }
    }

    fn line_continued(&self) -> bool {
        let mut i = self.pos;
        while i > 0 {
            i -= 1;
            match self.text[i] {
                b'\\' => return true,
                b'\r' => continue,
                _ => return false,
            }
        }
        false
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while self.pos < self.text.len() {
            if self.text[self.pos] == b'*' && self.peek_at(1) == b'/' {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
        // Unterminated comment: nothing after it can be a marker.
    }

    fn skip_string(&mut self, quote: u8) {
        self.pos += 1;
        while self.pos < self.text.len() {
            match self.text[self.pos] {
                b'\\' => self.pos += 2,
                b'\n' => {
                    // Unterminated literal; resume normal lexing rather
                    // than swallowing the rest of the file.
                    self.pos += 1;
                    return;
                }
                b if b == quote => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Raw string literal `R"delim( ... )delim"`, entered with `pos` on
    /// the opening quote.
    fn skip_raw_string(&mut self) {
        self.pos += 1; // Opening quote.

        let delim_start = self.pos;
        while self.pos < self.text.len() && self.text[self.pos] != b'(' {
            self.pos += 1;
        }
        let delim = &self.text[delim_start..self.pos.min(self.text.len())];

        // Scan for `)delim"`.
        let mut closer = Vec::with_capacity(delim.len() + 2);
        closer.push(b')');
        closer.extend_from_slice(delim);
        closer.push(b'"');

        while self.pos < self.text.len() {
            if self.text[self.pos..].starts_with(&closer) {
                self.pos += closer.len();
                return;
            }
            self.pos += 1;
        }
    }

    /// Lex one identifier; returns true if it is a marker. Handles the
    /// raw-string prefixes (`R"`, `u8R"`, `LR"`, ...) which look like an
    /// identifier glued to a quote.
    fn lex_identifier(&mut self) -> bool {
        let start = self.pos;
        while self.pos < self.text.len() && is_ident_char(self.text[self.pos]) {
            self.pos += 1;
        }

        let ident = &self.text[start..self.pos];

        if self.pos < self.text.len() && self.peek() == b'"' {
            if matches!(ident, b"R" | b"u8R" | b"uR" | b"UR" | b"LR") {
                self.skip_raw_string();
                return false;
            }
            // Other encoding prefixes (u8, u, U, L) start an ordinary
            // literal; the main loop will skip it.
            return false;
        }

        MARKERS.iter().any(|m| m.as_bytes() == ident)
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_marker_is_found() {
        let src = b"class Widget: public QObject { Q_OBJECT public: };";
        assert!(contains_marker(src));
    }

    #[test]
    fn all_markers_are_recognized() {
        for m in MARKERS {
            let src = format!("struct S {{ {m} }};");
            assert!(contains_marker(src.as_bytes()), "marker {m}");
        }
    }

    #[test]
    fn substring_is_not_a_marker() {
        assert!(!contains_marker(b"int Q_OBJECTION = 0;"));
        assert!(!contains_marker(b"int MY_Q_OBJECT = 0;"));
        assert!(!contains_marker(b"int Q_OBJECT2 = 0;"));
    }

    #[test]
    fn marker_in_line_comment_does_not_count() {
        assert!(!contains_marker(b"// needs Q_OBJECT eventually\nint x;"));
    }

    #[test]
    fn marker_in_block_comment_does_not_count() {
        assert!(!contains_marker(b"/* Q_OBJECT */ int x;"));
        assert!(!contains_marker(b"/* unterminated Q_OBJECT"));
    }

    #[test]
    fn marker_after_comment_counts() {
        assert!(contains_marker(b"/* gadget */ Q_OBJECT"));
        assert!(contains_marker(b"// gadget\nQ_OBJECT"));
    }

    #[test]
    fn continued_line_comment_swallows_next_line() {
        assert!(!contains_marker(b"// comment \\\nQ_OBJECT\nint x;"));
    }

    #[test]
    fn marker_in_string_does_not_count() {
        assert!(!contains_marker(b"const char* s = \"Q_OBJECT\";"));
        assert!(!contains_marker(b"const char* s = \"say \\\"Q_OBJECT\\\"\";"));
    }

    #[test]
    fn marker_in_raw_string_does_not_count() {
        assert!(!contains_marker(b"auto s = R\"(Q_OBJECT)\";"));
        assert!(!contains_marker(b"auto s = R\"xy(has Q_OBJECT here)xy\";"));
        assert!(!contains_marker(b"auto s = u8R\"(Q_OBJECT)\";"));
    }

    #[test]
    fn marker_after_raw_string_counts() {
        assert!(contains_marker(b"auto s = R\"(text)\"; Q_OBJECT"));
    }

    #[test]
    fn marker_after_unterminated_string_line_counts() {
        // A lone quote on one line must not hide the rest of the file.
        assert!(contains_marker(b"char c = ' ;\nQ_OBJECT int x;"));
        assert!(contains_marker(b"const char* s = \"oops;\nQ_GADGET"));
    }

    #[test]
    fn invalid_cxx_still_scans() {
        assert!(contains_marker(b"%$#@ Q_GADGET }{"));
    }

    #[test]
    fn scan_file_reads_and_reports() {
        let dir = TempDir::new().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("widget.hxx")).unwrap();

        std::fs::write(&path, "class W { Q_OBJECT };").unwrap();
        assert!(scan_file(&path).unwrap());

        std::fs::write(&path, "class W { };").unwrap();
        assert!(!scan_file(&path).unwrap());
    }

    #[test]
    fn scan_file_missing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("nope.hxx")).unwrap();

        assert!(scan_file(&path).is_err());
    }
}
