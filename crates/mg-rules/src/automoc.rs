//! The aggregate discovery rule.
//!
//! An automoc group target owns a set of header and source files and
//! presents "everything the meta-object compiler should produce from
//! them" as a single buildable target. The member set is not written
//! down anywhere: it is discovered during the match phase by scanning
//! the inputs for meta-object markers, consulting the group's ledger to
//! skip inputs whose scan results are still current.
//!
//! Discovery walks the sorted inputs and the ledger in lock-step
//! ([`Reconcile::Lookup`]): a `0`-flagged entry with a matching,
//! fresh-enough path resolves the input without opening it, and the
//! first deviation of any kind switches the walk permanently to
//! [`Reconcile::Scan`]. Each positive input synthesizes a member target
//! whose identity is a pure function of the input's (so rediscovery
//! converges on the same graph nodes), wires the group's library and ad
//! hoc header prerequisites onto it, and hands it to the meta-object
//! compile rule.
//!
//! Clean must not read file contents, so it replays the ledger instead:
//! members are re-synthesized from recorded `1`-flag lines. That also
//! makes interrupted builds safe: member identity is always
//! re-derivable from ledger content, so recovery is replay, never
//! trusting cached pointers across invocations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use mg_depdb::{Depdb, Reconcile};
use mg_engine::{
    fsutil, BuildError, Engine, ExecBatch, ExecutionMode, FileKind, Include, MatchBatch,
    MatchContext, Operation, Prerequisite, Recipe, Rule, Target, TargetState,
};

use crate::options::reject_lib_group;

/// Rule identity/version stamp, the first line of the group ledger.
pub const AUTOMOC_RULE_ID: &str = "moc.automoc 1";

pub struct AutomocRule {
    /// Scanner invocations performed over this rule's lifetime; reported
    /// in debug output and a direct observable for rediscovery tests.
    scans: AtomicUsize,
}

impl Default for AutomocRule {
    fn default() -> AutomocRule {
        AutomocRule::new()
    }
}

impl AutomocRule {
    pub fn new() -> AutomocRule {
        AutomocRule {
            scans: AtomicUsize::new(0),
        }
    }

    pub fn scans_performed(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    fn ledger_path(group: &Target) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.automoc.d", group.path()))
    }

    /// Split the group's prerequisites into scannable inputs, libraries
    /// to propagate, and ad hoc headers to propagate. Everything else of
    /// normal include is ignored; ad hoc prerequisites of any other kind
    /// are rejected outright — the group's own recipe is not normally
    /// executed, so their effects would be silently skipped, which is
    /// worse than failing now.
    fn partition(
        &self,
        group: &Target,
    ) -> Result<(Vec<Arc<Target>>, Vec<Arc<Target>>, Vec<Arc<Target>>), BuildError> {
        let mut inputs = Vec::new();
        let mut libs = Vec::new();
        let mut adhoc = Vec::new();

        for p in group.prerequisites() {
            match p.include {
                Include::Excluded => {}
                Include::AdHoc => {
                    if p.target.kind == FileKind::Header {
                        adhoc.push(p.target.clone());
                    } else {
                        return Err(BuildError::config(
                            group,
                            format!(
                                "ad hoc prerequisite {} does not make sense here: \
                                 the group's recipe is not normally executed, so \
                                 its effects would be silently skipped",
                                p.target
                            ),
                        ));
                    }
                }
                Include::Normal => {
                    if p.target.kind.is_scannable() {
                        inputs.push(p.target.clone());
                    } else if p.target.kind.is_lib() {
                        reject_lib_group(group, &p.target)?;
                        libs.push(p.target.clone());
                    }
                    // Other kinds are none of our business.
                }
            }
        }

        Ok((inputs, libs, adhoc))
    }

    /// Derive, look up or create, wire up, and claim the member target
    /// for a positive input. The member's identity is deterministic:
    /// header `foo` makes a compilable `moc_foo.cxx` next to it, source
    /// `foo` an included `foo.moc`.
    async fn synthesize_member(
        &self,
        cx: MatchContext<'_>,
        group: &Arc<Target>,
        input: &Arc<Target>,
        libs: &[Arc<Target>],
        adhoc: &[Arc<Target>],
    ) -> Result<Arc<Target>, BuildError> {
        let engine = cx.engine;
        let stem = camino::Utf8Path::new(&input.name)
            .file_stem()
            .unwrap_or(input.name.as_str());

        let (kind, name) = match input.kind {
            FileKind::Header => (FileKind::MetaSource, format!("moc_{stem}.cxx")),
            FileKind::Source => (FileKind::MetaInline, format!("{stem}.moc")),
            _ => {
                return Err(BuildError::config(
                    group,
                    format!("prerequisite {input} is not a scannable input"),
                ))
            }
        };

        // The member lives next to its input, not next to the group:
        // inputs in subdirectories get their outputs there too.
        let (member, created) = engine.graph.search_or_create(kind, &input.dir, &name);

        // A pre-existing target that something already matched this
        // operation, outside any group, is spoken for; claiming it would
        // hand one output to two recipes.
        if !created
            && member.group().is_none()
            && engine.matched_rule(cx.op, cx.seq, &member).await.is_some()
        {
            return Err(BuildError::config(
                &member,
                "already matched outside of its group",
            ));
        }

        let mut ps = Vec::with_capacity(1 + libs.len() + adhoc.len());
        ps.push(Prerequisite::new(input.clone()));
        ps.extend(libs.iter().cloned().map(Prerequisite::new));
        ps.extend(adhoc.iter().cloned().map(Prerequisite::adhoc));

        if !member.try_init_prerequisites(ps) {
            // An existing target is fine as long as it agrees on what it
            // is generated from; think operation batches, or a target
            // the user declared to attach variables to.
            match member.first_prerequisite() {
                Some(fp) if Arc::ptr_eq(&fp, input) => {}
                Some(fp) => {
                    return Err(BuildError::config(
                        &member,
                        format!(
                            "existing target has incompatible prerequisites: \
                             expected {input} first, found {fp}"
                        ),
                    ));
                }
                None => {
                    return Err(BuildError::config(
                        &member,
                        format!(
                            "existing target has incompatible prerequisites: \
                             expected {input} first, found none"
                        ),
                    ));
                }
            }
        }

        if created {
            debug!(member = %member, input = %input, "synthesized group member");
        }

        member.set_group(group).map_err(|owner| {
            BuildError::config(
                &member,
                format!("already a member of a different group {owner}"),
            )
        })?;

        Ok(member)
    }

    async fn apply_update(
        &self,
        cx: MatchContext<'_>,
        group: &Arc<Target>,
    ) -> Result<Recipe, BuildError> {
        let engine = cx.engine;
        let (op, seq) = (cx.op, cx.seq);

        let (mut inputs, libs, adhoc) = self.partition(group)?;

        // Batch-match the inputs, then bring them up to date: we are
        // about to read their contents, so "current as of this
        // operation" is part of the scan's meaning.
        {
            let mut batch = MatchBatch::new(engine, op, seq);
            for input in &inputs {
                batch.submit(input);
            }
            batch.join().await.finalize()?;
        }
        engine.update_during_match(op, seq, &inputs).await?;

        // The ledger is ordered; the walk below requires the inputs to
        // line up with it.
        inputs.sort_by(|a, b| a.path().cmp(&b.path()));

        fsutil::ensure_dir(&group.dir)?;
        let mut dd = Depdb::open(Self::ledger_path(group))?;

        let mut mode = Reconcile::Lookup;
        if dd.writing() {
            mode.on_deviation();
        }
        if let Some(stale) = dd.expect(AUTOMOC_RULE_ID) {
            trace!(group = %group, ?stale, "rule mismatch forcing rescan");
            mode.on_deviation();
        }

        let mut members: Vec<Arc<Target>> = Vec::new();
        for input in &inputs {
            let input_path = input.path();

            // Resolve the input's "needs generation" flag: from the
            // ledger while it still agrees with reality, from the
            // scanner afterwards.
            let mut needs_gen: Option<bool> = None;

            if !mode.is_scan() {
                match dd.read().map(parse_entry) {
                    Some(Some((flag, path))) if path == input_path => {
                        // Entry matches; trust it only if the input has
                        // not been touched since the ledger was written.
                        match (input.mtime(), dd.mtime()) {
                            (Some(im), Some(lm)) if im <= lm => needs_gen = Some(flag),
                            _ => mode.on_deviation(),
                        }
                    }
                    // Missing, unparsable, or some other input's entry.
                    _ => mode.on_deviation(),
                }
            }

            let needs_gen = match needs_gen {
                Some(flag) => flag,
                None => {
                    let found = mg_scan::scan_file(&input_path)?;
                    self.scans.fetch_add(1, Ordering::Relaxed);
                    dd.write(&format!("{} {}", found as u8, input_path));
                    found
                }
            };

            if !needs_gen {
                continue;
            }

            members.push(
                self.synthesize_member(cx, group, input, &libs, &adhoc)
                    .await?,
            );
        }

        debug!(
            group = %group,
            inputs = inputs.len(),
            members = members.len(),
            scanned = self.scans_performed(),
            "discovery complete"
        );

        // Inputs that disappeared leave a stale tail; closing drops it.
        dd.close()?;

        group.set_members(op, seq, members.clone());

        // Match the members through the group, batch then finalize.
        {
            let mut batch = MatchBatch::for_group(engine, op, seq, group);
            for m in &members {
                batch.submit(m);
            }
            batch.join().await.finalize()?;
        }

        Ok(Recipe::perform(move |engine, group| {
            perform(engine, group, op, seq, false)
        }))
    }

    async fn apply_clean(
        &self,
        cx: MatchContext<'_>,
        group: &Arc<Target>,
    ) -> Result<Recipe, BuildError> {
        let engine = cx.engine;
        let (op, seq) = (cx.op, cx.seq);

        let ledger_path = Self::ledger_path(group);
        if fsutil::mtime(&ledger_path).is_none() {
            // Never updated (or already cleaned): nothing to discover,
            // nothing to remove.
            group.set_members(op, seq, Vec::new());
            return Ok(Recipe::Noop);
        }

        let (inputs, libs, adhoc) = self.partition(group)?;

        // Replay, never scan: clean must not depend on input contents,
        // only on what the last successful update recorded.
        let mut dd = Depdb::open(ledger_path)?;
        if dd.writing() || dd.expect(AUTOMOC_RULE_ID).is_some() {
            return Err(BuildError::config(
                group,
                "cannot clean: the recorded scan results are from an \
                 incompatible rule version; run update first or remove \
                 the outputs manually",
            ));
        }

        let live: HashMap<Utf8PathBuf, Arc<Target>> = inputs
            .iter()
            .map(|i| (i.path(), i.clone()))
            .collect();

        let mut members: Vec<Arc<Target>> = Vec::new();
        loop {
            let entry = match dd.read().map(parse_entry) {
                None => break,
                Some(Some(entry)) => entry,
                Some(None) => {
                    return Err(BuildError::config(
                        group,
                        "cannot clean: recorded scan results are corrupt; \
                         run update first or remove the outputs manually",
                    ));
                }
            };

            let (flag, path) = entry;
            if !flag {
                continue;
            }
            // Entries for inputs no longer declared are left alone; we
            // only clean what is still ours to clean.
            let Some(input) = live.get(&path) else {
                continue;
            };

            members.push(
                self.synthesize_member(cx, group, input, &libs, &adhoc)
                    .await?,
            );
        }
        dd.close()?;

        group.set_members(op, seq, members.clone());

        {
            let mut batch = MatchBatch::for_group(engine, op, seq, group);
            for m in &members {
                batch.submit(m);
            }
            batch.join().await.finalize()?;
        }

        Ok(Recipe::perform(move |engine, group| {
            perform(engine, group, op, seq, true)
        }))
    }
}

fn parse_entry(line: &str) -> Option<(bool, Utf8PathBuf)> {
    let (flag, path) = line.split_at_checked(2)?;
    let flag = match flag {
        "0 " => false,
        "1 " => true,
        _ => return None,
    };
    if path.is_empty() {
        return None;
    }
    Some((flag, Utf8PathBuf::from(path)))
}

/// Fan out execution to the members in the operation's declared order
/// and merge their states; afterwards, for clean, retire the group's own
/// ledger.
async fn perform(
    engine: Arc<Engine>,
    group: Arc<Target>,
    op: Operation,
    seq: u64,
    remove_ledger: bool,
) -> Result<TargetState, BuildError> {
    let members = group.members_for(op, seq).unwrap_or_default();

    let mut batch = ExecBatch::new(&engine, op, seq);
    match op.execution_mode() {
        ExecutionMode::Forward => {
            for m in &members {
                batch.submit(m);
            }
        }
        ExecutionMode::Reverse => {
            for m in members.iter().rev() {
                batch.submit(m);
            }
        }
    }
    let mut state = batch.join().await.merge()?;

    if remove_ledger && fsutil::remove_file(&AutomocRule::ledger_path(&group))? {
        state = TargetState::Changed;
    }

    Ok(state)
}

impl Rule for AutomocRule {
    fn name(&self) -> &'static str {
        "moc.automoc"
    }

    fn matches(&self, _op: Operation, target: &Target) -> bool {
        target.kind == FileKind::AutomocGroup
            && target.prerequisites().iter().any(|p| {
                p.include == Include::Normal && p.target.kind.is_scannable()
            })
    }

    fn apply<'a>(
        &'a self,
        cx: MatchContext<'a>,
        target: &'a Arc<Target>,
    ) -> BoxFuture<'a, Result<Recipe, BuildError>> {
        Box::pin(async move {
            match cx.op {
                Operation::Update => self.apply_update(cx, target).await,
                Operation::Clean => self.apply_clean(cx, target).await,
                Operation::ConfigureUpdate => {
                    // Leave the member set "present but undiscovered";
                    // operations that do not discover must still leave a
                    // well-formed state behind.
                    if target.members_for(cx.op, cx.seq).is_none() {
                        target.set_members(cx.op, cx.seq, Vec::new());
                    }
                    Ok(Recipe::Noop)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_entries_parse() {
        assert_eq!(
            parse_entry("1 /tmp/a.hxx"),
            Some((true, Utf8PathBuf::from("/tmp/a.hxx")))
        );
        assert_eq!(
            parse_entry("0 /tmp/b.hxx"),
            Some((false, Utf8PathBuf::from("/tmp/b.hxx")))
        );
        assert_eq!(parse_entry("2 /tmp/a.hxx"), None);
        assert_eq!(parse_entry("1"), None);
        assert_eq!(parse_entry("1 "), None);
        assert_eq!(parse_entry(""), None);
    }
}
