//! Single-file compile rules: one input, one generator run, one output.
//!
//! Three rule instances share this shape, one per generator: the
//! meta-object compiler (headers and sources to generated C++), the
//! resource compiler (resource collections to generated C++), and the
//! UI-form compiler (form descriptions to generated headers). The
//! meta-object instance is the full shape — library classification,
//! auxiliary dependency replay and harvest — while the other two are its
//! degenerate form (stamp/checksum/options/input ledger only).
//!
//! Incremental behavior rests on the per-output ledger: rule stamp, tool
//! checksum, options hash and input path are verified during the match
//! phase; for the meta-object compiler the auxiliary dependencies the
//! generator reported last time are then replayed against the
//! filesystem, and on regeneration the fresh byproduct dependency file
//! is harvested back into the ledger.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::BoxFuture;
use tracing::trace;

use mg_depdb::{Depdb, ReopenState};
use mg_engine::process::{print_diag, print_process, run_process};
use mg_engine::{
    fsutil, BuildError, Engine, ExecBatch, FileKind, Include, MatchBatch, MatchContext,
    Operation, Recipe, Rule, Target, TargetState,
};

use crate::depfile;
use crate::options::{
    append_options, export_options, moc_auto_options, moc_sys_hdr_options, options_hash,
    reject_lib_group,
};
use crate::tool::Tool;

/// Which external generator a compile-rule instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    Moc,
    Rcc,
    Uic,
}

impl Generator {
    pub fn tool_name(self) -> &'static str {
        match self {
            Generator::Moc => "moc",
            Generator::Rcc => "rcc",
            Generator::Uic => "uic",
        }
    }

    /// Rule identity/version stamp, the first ledger line.
    pub fn rule_id(self) -> &'static str {
        match self {
            Generator::Moc => "moc.compile 1",
            Generator::Rcc => "rcc.compile 1",
            Generator::Uic => "uic.compile 1",
        }
    }

    pub fn options_key(self) -> &'static str {
        match self {
            Generator::Moc => "moc.options",
            Generator::Rcc => "rcc.options",
            Generator::Uic => "uic.options",
        }
    }

    fn rule_name(self) -> &'static str {
        match self {
            Generator::Moc => "moc.compile",
            Generator::Rcc => "rcc.compile",
            Generator::Uic => "uic.compile",
        }
    }

    /// The input kind expected for an output of kind `out`, if this
    /// generator produces such outputs at all.
    fn input_kind(self, out: FileKind) -> Option<FileKind> {
        match (self, out) {
            (Generator::Moc, FileKind::MetaSource) => Some(FileKind::Header),
            (Generator::Moc, FileKind::MetaInline) => Some(FileKind::Source),
            (Generator::Rcc, FileKind::ResourceSource) => Some(FileKind::Resource),
            (Generator::Uic, FileKind::UiHeader) => Some(FileKind::UiForm),
            _ => None,
        }
    }

    /// The input stem the naming convention requires for this output
    /// (`moc_foo.cxx` wants a header with stem `foo`, `foo.moc` a source
    /// with stem `foo`, and so on). `None` if the name violates the
    /// convention.
    fn expected_stem(self, target: &Target) -> Option<String> {
        let stem = Utf8Path::new(&target.name).file_stem()?;
        let stem = match target.kind {
            FileKind::MetaSource => stem.strip_prefix("moc_")?,
            FileKind::MetaInline => stem,
            FileKind::ResourceSource => stem.strip_prefix("qrc_")?,
            FileKind::UiHeader => stem.strip_prefix("ui_")?,
            _ => return None,
        };
        Some(stem.to_owned())
    }
}

/// Everything the match phase decided, handed to the execute phase.
struct MatchData {
    gen: Generator,
    tool: Tool,
    op: Operation,
    seq: u64,
    input: Arc<Target>,
    input_path: Utf8PathBuf,
    out_path: Utf8PathBuf,
    ledger_path: Utf8PathBuf,
    update: bool,
    /// Validated ledger content, to be appended to with freshly
    /// harvested auxiliary dependencies (meta-object compiler only).
    reopen: Option<ReopenState>,
    /// Auxiliary ledger lines already validated during replay; that many
    /// leading byproduct entries are not re-appended.
    skip_count: usize,
    /// Library prerequisites built during execute.
    deferred_libs: Vec<Arc<Target>>,
    /// Library prerequisites kept only for their exported options.
    probed_libs: Vec<Arc<Target>>,
    /// Paths of static prerequisites; never written to the ledger.
    static_paths: Vec<Utf8PathBuf>,
}

pub struct CompileRule {
    gen: Generator,
    tool: Tool,
}

impl CompileRule {
    pub fn new(gen: Generator, tool: Tool) -> CompileRule {
        CompileRule { gen, tool }
    }

    pub fn generator(&self) -> Generator {
        self.gen
    }

    /// The input prerequisite this rule would compile for `target`:
    /// first normal prerequisite of the expected kind whose stem
    /// satisfies the naming convention, or any one of the expected kind
    /// under an explicit rule hint.
    fn find_input(&self, target: &Target) -> Option<Arc<Target>> {
        let want = self.gen.input_kind(target.kind)?;

        let hinted = target
            .var_strings("rule.hint")
            .is_some_and(|h| h.iter().any(|s| s == self.gen.tool_name()));
        let stem = if hinted {
            None
        } else {
            Some(self.gen.expected_stem(target)?)
        };

        for p in target.prerequisites() {
            if p.include != Include::Normal || p.target.kind != want {
                continue;
            }
            let ok = match &stem {
                None => true,
                Some(s) => Utf8Path::new(&p.target.name).file_stem() == Some(s.as_str()),
            };
            if ok {
                return Some(p.target.clone());
            }
        }
        None
    }

    fn clean_recipe(&self) -> Recipe {
        Recipe::perform(|_engine, target: Arc<Target>| async move {
            let out = target.path();
            let mut changed = fsutil::remove_file(&out)?;
            changed |= fsutil::remove_file(Utf8Path::new(&format!("{out}.d")))?;
            changed |= fsutil::remove_file(Utf8Path::new(&format!("{out}.t")))?;
            Ok(if changed {
                TargetState::Changed
            } else {
                TargetState::Unchanged
            })
        })
    }

    async fn apply_update(
        &self,
        cx: MatchContext<'_>,
        target: &Arc<Target>,
        input: Arc<Target>,
    ) -> Result<Recipe, BuildError> {
        let engine = cx.engine;
        let (op, seq) = (cx.op, cx.seq);

        // Classify and batch-match the static prerequisites: libraries
        // are deferred to execute (or unmatched entirely below), while
        // headers, sources and the like are updated eagerly because the
        // generator reads their contents.
        let mut eager: Vec<Arc<Target>> = Vec::new();
        let mut libs: Vec<Arc<Target>> = Vec::new();
        {
            let mut batch = MatchBatch::new(engine, op, seq);
            for p in target.prerequisites() {
                if p.include == Include::Excluded {
                    continue;
                }
                if p.target.kind.is_lib() {
                    if p.include != Include::Normal {
                        continue;
                    }
                    reject_lib_group(target, &p.target)?;
                    libs.push(p.target.clone());
                } else {
                    eager.push(p.target.clone());
                }
                batch.submit(&p.target);
            }
            batch.join().await.finalize()?;
        }

        // A library matched by the plain file rule has nothing to build;
        // keep it unmatched, purely as a source of exported options.
        let mut deferred_libs: Vec<Arc<Target>> = Vec::new();
        let mut probed_libs: Vec<Arc<Target>> = Vec::new();
        for lib in libs {
            match engine.matched_rule(op, seq, &lib).await {
                Some("file") => {
                    trace!(lib = %lib, "library prerequisite unmatched, probing options only");
                    probed_libs.push(lib);
                }
                _ => deferred_libs.push(lib),
            }
        }

        let prereq_state = engine.update_during_match(op, seq, &eager).await?;

        // The ledger decides whether the generator runs at all.
        fsutil::ensure_dir(&target.dir)?;
        let out_path = target.path();
        let ledger_path = Utf8PathBuf::from(format!("{out_path}.d"));
        let mut dd = Depdb::open(ledger_path.clone())?;

        if let Some(stale) = dd.expect(self.gen.rule_id()) {
            trace!(target = %target, ?stale, "rule mismatch forcing update");
        }
        if let Some(stale) = dd.expect(&self.tool.checksum) {
            trace!(target = %target, ?stale, "tool checksum mismatch forcing update");
        }
        let oh = options_hash(
            engine,
            target,
            self.gen.options_key(),
            self.gen == Generator::Moc,
        );
        if let Some(stale) = dd.expect(&oh) {
            trace!(target = %target, ?stale, "options mismatch forcing update");
        }
        let input_path = input.path();
        if let Some(stale) = dd.expect(input_path.as_str()) {
            trace!(target = %target, ?stale, "input file mismatch forcing update");
        }

        let mut update = dd.writing();
        let out_mt = target.mtime();
        if out_mt.is_none() {
            update = true;
        }

        // Ledger newer than output: a configuration change was recorded
        // but the output never regenerated (interrupted build).
        if !update {
            if let (Some(dm), Some(om)) = (dd.mtime(), out_mt) {
                if dm > om {
                    update = true;
                }
            }
        }

        if prereq_state == TargetState::Changed {
            update = true;
        }
        if !update {
            if let Some(om) = out_mt {
                for p in &eager {
                    match p.mtime() {
                        Some(pm) if pm <= om => {}
                        _ => {
                            update = true;
                            break;
                        }
                    }
                }
            }
        }

        // Replay the auxiliary dependencies recorded by the previous run
        // (meta-object compiler only): a missing one invalidates its
        // line, a fresher-than-the-ledger one forces regeneration.
        let mut skip_count = 0usize;
        if self.gen == Generator::Moc && !update {
            let ledger_mt = dd.mtime();
            loop {
                let line = match dd.read() {
                    None => break,
                    Some(l) => Utf8PathBuf::from(l),
                };

                self.verify_pure_auxiliary(engine, target, &line)?;

                match fsutil::mtime(&line) {
                    None => {
                        dd.invalidate();
                        update = true;
                        break;
                    }
                    Some(am) => {
                        skip_count += 1;
                        match ledger_mt {
                            Some(lm) if am <= lm => {}
                            _ => {
                                update = true;
                                break;
                            }
                        }
                    }
                }
            }
        }

        let reopen = if update && !engine.dry_run {
            if self.gen == Generator::Moc {
                // Auxiliary dependencies are appended after the run.
                Some(dd.close_to_reopen())
            } else {
                // No dynamic section; persist the rewritten head now,
                // ahead of the output it describes.
                dd.close()?;
                None
            }
        } else if !update {
            dd.close()?;
            None
        } else {
            // Dry run with a pending update: leave the ledger alone so
            // the next real run still sees the deviation.
            drop(dd);
            None
        };

        let md = MatchData {
            gen: self.gen,
            tool: self.tool.clone(),
            op,
            seq,
            input,
            input_path,
            out_path,
            ledger_path,
            update,
            reopen,
            skip_count,
            deferred_libs,
            probed_libs,
            static_paths: eager.iter().map(|p| p.path()).collect(),
        };

        Ok(Recipe::perform(move |engine, target| {
            perform_update(engine, target, md)
        }))
    }

    /// An auxiliary dependency that something else regenerates must be
    /// declared as a static prerequisite: as a replayed ledger path it
    /// would never be rebuilt before use.
    fn verify_pure_auxiliary(
        &self,
        engine: &Engine,
        target: &Target,
        path: &Utf8Path,
    ) -> Result<(), BuildError> {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(());
        };
        let (aux, _) = engine.graph.search_or_create(FileKind::Header, dir, name);
        if aux.has_prerequisites() {
            return Err(BuildError::config(
                target,
                format!(
                    "auxiliary dependency {path} has its own build recipe; \
                     declare it as a static prerequisite instead"
                ),
            ));
        }
        Ok(())
    }
}

impl Rule for CompileRule {
    fn name(&self) -> &'static str {
        self.gen.rule_name()
    }

    fn matches(&self, _op: Operation, target: &Target) -> bool {
        self.find_input(target).is_some()
    }

    fn apply<'a>(
        &'a self,
        cx: MatchContext<'a>,
        target: &'a Arc<Target>,
    ) -> BoxFuture<'a, Result<Recipe, BuildError>> {
        Box::pin(async move {
            let input = self.find_input(target).ok_or_else(|| {
                BuildError::config(target, "no suitable input prerequisite")
            })?;

            match cx.op {
                Operation::ConfigureUpdate => Ok(Recipe::Noop),
                Operation::Clean => Ok(self.clean_recipe()),
                Operation::Update => self.apply_update(cx, target, input).await,
            }
        })
    }
}

async fn perform_update(
    engine: Arc<Engine>,
    target: Arc<Target>,
    md: MatchData,
) -> Result<TargetState, BuildError> {
    // Build the deferred library prerequisites. Their states do not
    // factor into the update decision: only their exported options reach
    // the generator, and those are configuration.
    if !md.deferred_libs.is_empty() {
        let mut batch = ExecBatch::new(&engine, md.op, md.seq);
        for lib in &md.deferred_libs {
            batch.submit(lib);
        }
        batch.join().await.merge()?;
    }

    if !md.update {
        return Ok(TargetState::Unchanged);
    }

    // Assemble the command line. Order is significant: the generator
    // resolves option conflicts last-wins, so user options come first
    // and system header paths last.
    let mut args: Vec<String> = Vec::new();
    append_options(&mut args, &engine, &target, md.gen.options_key());

    let depfile_path = Utf8PathBuf::from(format!("{}.t", md.out_path));

    match md.gen {
        Generator::Moc => {
            args.extend(moc_auto_options(&engine));
            for lib in md.probed_libs.iter().chain(md.deferred_libs.iter()) {
                args.extend(export_options(lib));
            }
            args.extend(moc_sys_hdr_options(&engine));

            match target.kind {
                // Compiled on its own: override the generated #include
                // of the input with just its file name.
                FileKind::MetaSource => {
                    args.push("-f".to_owned());
                    args.push(md.input.name.clone());
                }
                // Included into its input: suppress the generated
                // #include to avoid multiple definitions.
                FileKind::MetaInline => args.push("-i".to_owned()),
                _ => {}
            }

            args.push("--output-dep-file".to_owned());
            args.push("--dep-file-path".to_owned());
            args.push(depfile_path.to_string());
        }
        Generator::Rcc => {
            // The resource infrastructure effectively requires --name;
            // default it to the input stem when the user didn't pass one.
            let has_name = args.iter().any(|a| {
                a == "--name"
                    || a == "-name"
                    || a.starts_with("--name=")
                    || a.starts_with("-name=")
            });
            if !has_name {
                args.push("--name".to_owned());
                args.push(
                    Utf8Path::new(&md.input.name)
                        .file_stem()
                        .unwrap_or(md.input.name.as_str())
                        .to_owned(),
                );
            }
        }
        Generator::Uic => {}
    }

    args.push("-o".to_owned());
    args.push(md.out_path.to_string());
    args.push(md.input_path.to_string());

    if engine.verbosity >= 2 {
        print_process(md.tool.program(), &args);
    } else {
        print_diag(&engine, md.tool.name, &md.input, &target);
    }

    if engine.dry_run {
        return Ok(TargetState::Changed);
    }

    run_process(&engine, md.tool.program(), &args, &target.dir).await?;

    // Harvest the byproduct dependency file into the reopened ledger.
    if md.gen == Generator::Moc {
        let Some(state) = md.reopen else {
            return Err(BuildError::Worker(
                "compile ledger state lost between match and execute".to_owned(),
            ));
        };
        let mut dd = Depdb::reopen(state);

        let deps = depfile::parse(&depfile_path)?;
        let mut skip = md.skip_count;
        for dep in deps {
            if dep == md.input_path || md.static_paths.contains(&dep) {
                continue;
            }
            if skip > 0 {
                // Already validated during replay; its line is part of
                // the ledger prefix.
                skip -= 1;
                continue;
            }

            if let (Some(dir), Some(name)) = (dep.parent(), dep.file_name()) {
                let (aux, _) = engine.graph.search_or_create(FileKind::Header, dir, name);
                if aux.has_prerequisites() {
                    return Err(BuildError::config(
                        &target,
                        format!(
                            "auxiliary dependency {dep} has its own build recipe; \
                             declare it as a static prerequisite instead"
                        ),
                    ));
                }
            }

            dd.write(dep.as_str());
        }
        dd.close()?;
    }

    // Stamp the output after the ledger so on-disk order (ledger older
    // than output) holds, then verify the timestamps actually obeyed.
    fsutil::touch_now(&md.out_path)?;
    mg_depdb::check_mtime(&md.ledger_path, &md.out_path)?;
    target.refresh_mtime();

    Ok(TargetState::Changed)
}
