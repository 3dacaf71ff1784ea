//! Generator option assembly and hashing.
//!
//! Options come from several places and their order matters: later
//! entries must be able to override earlier ones under the generators'
//! own last-wins precedence. The order is: user-supplied options, then
//! (per toggle) the project's preprocessor options and predefined
//! macros, then per-library exported options, then system header search
//! paths.
//!
//! The option classes that are configuration (everything except the
//! library exports, which are only known at execute time) are hashed
//! into the output's ledger so that flipping a toggle or editing an
//! option forces regeneration.

use mg_engine::{BuildError, Engine, FileKind, Target};

/// Append the build-wide then per-target values of `key`.
pub fn append_options(args: &mut Vec<String>, engine: &Engine, target: &Target, key: &str) {
    args.extend(engine.vars.strings(key).iter().cloned());
    if let Some(v) = target.var_strings(key) {
        args.extend(v);
    }
}

/// Resolve one of the `moc.auto_*` toggles. An unset toggle falls back
/// to the blanket `moc.auto_preprocessor`, which itself defaults to off:
/// pulling compiler-environment options into a code generator is opt-in.
pub fn auto_toggle(engine: &Engine, key: &str) -> bool {
    engine
        .vars
        .bool_of(key)
        .or_else(|| engine.vars.bool_of("moc.auto_preprocessor"))
        .unwrap_or(false)
}

/// Reject a library prerequisite that cannot answer an export-options
/// query. A bare library group leaves "which variant's options" open, so
/// it is a configuration error wherever options must be extracted.
pub fn reject_lib_group(for_target: &Target, lib: &Target) -> Result<(), BuildError> {
    if lib.kind == FileKind::LibGroup {
        return Err(BuildError::config(
            for_target,
            format!(
                "unable to extract preprocessor options from {lib} directly; \
                 declare a variant-selected utility library instead"
            ),
        ));
    }
    Ok(())
}

/// Exported preprocessor options of a library prerequisite. The library
/// is probed, not built: only its declared `export.poptions` are read.
pub fn export_options(lib: &Target) -> Vec<String> {
    lib.var_strings("export.poptions").unwrap_or_default()
}

/// The configuration option classes for the meta-object compiler, in
/// command-line order: project preprocessor options, predefined macros,
/// and system header directories, each behind its toggle.
pub fn moc_auto_options(engine: &Engine) -> Vec<String> {
    let mut args = Vec::new();

    if auto_toggle(engine, "moc.auto_poptions") {
        args.extend(engine.vars.strings("cc.poptions").iter().cloned());
        args.extend(engine.vars.strings("cxx.poptions").iter().cloned());
    }

    if auto_toggle(engine, "moc.auto_predefs") {
        args.extend(engine.vars.strings("moc.predefs").iter().cloned());
    }

    args
}

/// System header search paths, appended last so project paths win.
pub fn moc_sys_hdr_options(engine: &Engine) -> Vec<String> {
    let mut args = Vec::new();

    if auto_toggle(engine, "moc.auto_sys_hdr_dirs") {
        for dir in engine.vars.strings("cc.sys_hdr_dirs") {
            args.push(format!("-I{dir}"));
        }
    }

    args
}

/// Hash of the effective configured option set for `target`, recorded in
/// its ledger. Library export options are not part of the hash: they are
/// execute-time data, tracked through the libraries themselves.
pub fn options_hash(engine: &Engine, target: &Target, options_key: &str, moc: bool) -> String {
    let mut hasher = blake3::Hasher::new();

    let mut push = |args: &[String]| {
        for a in args {
            hasher.update(a.as_bytes());
            hasher.update(b"\0");
        }
    };

    let mut user = Vec::new();
    append_options(&mut user, engine, target, options_key);
    push(&user);

    if moc {
        push(&moc_auto_options(engine));
        push(&moc_sys_hdr_options(engine));
    }

    hex::encode(hasher.finalize().as_bytes())
}
