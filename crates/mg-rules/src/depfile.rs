//! Parser for generator-emitted byproduct dependency files.
//!
//! Generators that support dependency tracking (the meta-object compiler
//! does) are asked to emit, next to their output, a list of every file
//! they consulted, in standard makefile-rule syntax:
//!
//! ```make
//! moc_widget.cxx: widget.hxx \
//!   detail/helper.hxx
//! ```
//!
//! Only the prerequisite tokens matter; targets (everything before the
//! `:`) are discarded. Escaping follows make: `\ ` is a literal space in
//! a filename, `\\` a literal backslash, `\#` a literal hash, and a
//! trailing `\` continues the line. Unescaped `#` starts a comment.
//!
//! Unlike a build's own makefiles, a byproduct file is machine-written
//! moments before we read it, so syntax errors are not user mistakes to
//! tolerate but a broken generator contract: they are fatal.

use camino::{Utf8Path, Utf8PathBuf};

use mg_engine::BuildError;

/// Read and parse the byproduct dependency file at `path`, returning the
/// prerequisite paths in order of first appearance (duplicates removed).
pub fn parse(path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BuildError> {
    let text = std::fs::read_to_string(path).map_err(|source| BuildError::Io {
        action: "read",
        path: path.to_owned(),
        source,
    })?;

    parse_content(&text, path)
}

/// Parse byproduct dependency content. `path` is for diagnostics only.
pub fn parse_content(text: &str, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BuildError> {
    let malformed = |detail: &str| BuildError::Depfile {
        path: path.to_owned(),
        detail: detail.to_owned(),
    };

    let mut deps: Vec<Utf8PathBuf> = Vec::new();
    let mut token = String::new();
    // Whether the current rule line has passed its `:` separator yet.
    let mut in_prereqs = false;

    let mut chars = text.chars().peekable();

    // A completed token is a prerequisite after the `:`, a discarded
    // target before it.
    fn flush(token: &mut String, deps: &mut Vec<Utf8PathBuf>, in_prereqs: bool) {
        if token.is_empty() {
            return;
        }
        if in_prereqs {
            deps.push(Utf8PathBuf::from(token.as_str()));
        }
        token.clear();
    }

    while let Some(c) = chars.next() {
        match c {
            ':' if !in_prereqs => {
                token.clear();
                in_prereqs = true;
            }
            '\\' => match chars.peek() {
                Some('\n') => {
                    // Continuation: the rule line goes on.
                    chars.next();
                    flush(&mut token, &mut deps, in_prereqs);
                }
                Some('\r') => {
                    chars.next();
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    flush(&mut token, &mut deps, in_prereqs);
                }
                Some(' ') => {
                    chars.next();
                    token.push(' ');
                }
                Some('\\') => {
                    chars.next();
                    token.push('\\');
                }
                Some('#') => {
                    chars.next();
                    token.push('#');
                }
                Some(_) => token.push('\\'),
                None => return Err(malformed("incomplete dependency declaration")),
            },
            '#' => {
                flush(&mut token, &mut deps, in_prereqs);
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ' ' | '\t' => flush(&mut token, &mut deps, in_prereqs),
            '\n' | '\r' => {
                if !in_prereqs && !token.is_empty() {
                    return Err(malformed("rule line without ':' separator"));
                }
                flush(&mut token, &mut deps, in_prereqs);
                // Next line starts a new rule (if any).
                in_prereqs = false;
            }
            _ => token.push(c),
        }
    }

    if !in_prereqs && !token.is_empty() {
        return Err(malformed("rule line without ':' separator"));
    }
    flush(&mut token, &mut deps, in_prereqs);

    // Keep first occurrences only.
    let mut seen = std::collections::HashSet::new();
    deps.retain(|d| seen.insert(d.clone()));

    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Vec<Utf8PathBuf> {
        parse_content(text, Utf8Path::new("out.t")).unwrap()
    }

    #[test]
    fn simple_rule() {
        let deps = parse_ok("moc_widget.cxx: widget.hxx helper.hxx\n");
        assert_eq!(deps, ["widget.hxx", "helper.hxx"].map(Utf8PathBuf::from));
    }

    #[test]
    fn targets_are_discarded() {
        let deps = parse_ok("a.o b.o: dep.hxx\n");
        assert_eq!(deps, [Utf8PathBuf::from("dep.hxx")]);
    }

    #[test]
    fn line_continuation() {
        let deps = parse_ok("out: a.hxx \\\n  b.hxx \\\n  c.hxx\n");
        assert_eq!(deps, ["a.hxx", "b.hxx", "c.hxx"].map(Utf8PathBuf::from));
    }

    #[test]
    fn escaped_space_and_backslash() {
        let deps = parse_ok(r"out: with\ space.hxx back\\slash.hxx");
        assert_eq!(
            deps,
            ["with space.hxx", "back\\slash.hxx"].map(Utf8PathBuf::from)
        );
    }

    #[test]
    fn escaped_hash_and_comment() {
        let deps = parse_ok("out: odd\\#name.hxx # trailing comment\n");
        assert_eq!(deps, [Utf8PathBuf::from("odd#name.hxx")]);
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let deps = parse_ok("out: a.hxx b.hxx a.hxx\n");
        assert_eq!(deps, ["a.hxx", "b.hxx"].map(Utf8PathBuf::from));
    }

    #[test]
    fn multiple_rules_accumulate() {
        let deps = parse_ok("x: a.hxx\ny: b.hxx\n");
        assert_eq!(deps, ["a.hxx", "b.hxx"].map(Utf8PathBuf::from));
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(parse_ok("").is_empty());
        assert!(parse_ok("out:\n").is_empty());
    }

    #[test]
    fn missing_colon_is_fatal() {
        let err = parse_content("just some words\n", Utf8Path::new("out.t")).unwrap_err();
        assert!(matches!(err, BuildError::Depfile { .. }));
    }

    #[test]
    fn trailing_backslash_is_fatal() {
        let err = parse_content("out: a.hxx \\", Utf8Path::new("out.t")).unwrap_err();
        assert!(matches!(err, BuildError::Depfile { .. }));
    }
}
