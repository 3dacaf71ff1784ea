//! The target/prerequisite graph.
//!
//! Targets live in an identity-keyed arena owned by [`Graph`]: one node
//! per unique `(kind, dir, name)` tuple, created on first lookup and
//! reused for the rest of the build invocation. Rules hold `Arc`s into
//! the arena but never own targets.
//!
//! Aggregate (automoc) targets additionally carry a member list that is
//! discovered during the match phase of a specific operation and stamped
//! with `(operation, invocation)`; a member list from another operation
//! is never trusted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::vars::Value;
use crate::Operation;

/// The kind of file (or file set) a target stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// C/C++ header (`.h`, `.hxx`, `.hpp`).
    Header,
    /// C/C++ source (`.cxx`, `.cpp`, `.cc`).
    Source,
    /// Generated, compilable source produced from a header (`moc_foo.cxx`).
    MetaSource,
    /// Generated, included-only fragment produced from a source (`foo.moc`).
    MetaInline,
    /// Resource collection file (`.qrc`).
    Resource,
    /// Generated source produced from a resource collection.
    ResourceSource,
    /// UI form description (`.ui`).
    UiForm,
    /// Generated header produced from a UI form (`ui_foo.h`).
    UiHeader,
    /// Aggregate whose members are discovered by scanning its inputs.
    AutomocGroup,
    /// Static library.
    LibStatic,
    /// Shared library.
    LibShared,
    /// Utility library with a selected variant; safe to probe for export
    /// options without committing to build it.
    LibUtil,
    /// Library group with no variant selected. Ambiguous wherever options
    /// must be extracted, and rejected there.
    LibGroup,
}

impl FileKind {
    pub fn is_lib(self) -> bool {
        matches!(
            self,
            FileKind::LibStatic | FileKind::LibShared | FileKind::LibUtil | FileKind::LibGroup
        )
    }

    /// Header/source inputs that the automoc rule scans.
    pub fn is_scannable(self) -> bool {
        matches!(self, FileKind::Header | FileKind::Source)
    }

    pub fn is_generated(self) -> bool {
        matches!(
            self,
            FileKind::MetaSource
                | FileKind::MetaInline
                | FileKind::ResourceSource
                | FileKind::UiHeader
        )
    }

    fn tag(self) -> &'static str {
        match self {
            FileKind::Header => "header",
            FileKind::Source => "source",
            FileKind::MetaSource => "meta_source",
            FileKind::MetaInline => "meta_inline",
            FileKind::Resource => "resource",
            FileKind::ResourceSource => "resource_source",
            FileKind::UiForm => "ui_form",
            FileKind::UiHeader => "ui_header",
            FileKind::AutomocGroup => "automoc",
            FileKind::LibStatic => "liba",
            FileKind::LibShared => "libs",
            FileKind::LibUtil => "libul",
            FileKind::LibGroup => "lib",
        }
    }
}

/// How a prerequisite participates in its target's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    Normal,
    /// Present in the graph but outside normal iteration; rules decide
    /// per-kind what (if anything) ad hoc prerequisites mean.
    AdHoc,
    /// Declared but switched off; ignored everywhere.
    Excluded,
}

/// A typed, directed edge to a concrete target.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub target: Arc<Target>,
    pub include: Include,
}

impl Prerequisite {
    pub fn new(target: Arc<Target>) -> Prerequisite {
        Prerequisite {
            target,
            include: Include::Normal,
        }
    }

    pub fn adhoc(target: Arc<Target>) -> Prerequisite {
        Prerequisite {
            target,
            include: Include::AdHoc,
        }
    }

    pub fn excluded(target: Arc<Target>) -> Prerequisite {
        Prerequisite {
            target,
            include: Include::Excluded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetKey {
    kind: FileKind,
    dir: Utf8PathBuf,
    name: String,
}

/// Member list of an aggregate target, valid only for the recorded
/// operation and invocation.
#[derive(Debug, Clone)]
struct Members {
    op: Operation,
    seq: u64,
    list: Vec<Arc<Target>>,
}

/// A node in the build graph.
pub struct Target {
    pub kind: FileKind,
    /// Absolute directory the target's file lives in.
    pub dir: Utf8PathBuf,
    /// File name, extension included.
    pub name: String,

    prereqs: Mutex<Vec<Prerequisite>>,
    vars: Mutex<HashMap<String, Value>>,
    group: Mutex<Option<Weak<Target>>>,
    members: Mutex<Option<Members>>,
    mtime_cache: Mutex<Option<Option<SystemTime>>>,

    pub(crate) match_slot: tokio::sync::Mutex<Option<crate::engine::Matched>>,
    pub(crate) exec_slot: tokio::sync::Mutex<Option<crate::engine::Executed>>,
}

impl Target {
    fn new(kind: FileKind, dir: Utf8PathBuf, name: String) -> Target {
        Target {
            kind,
            dir,
            name,
            prereqs: Mutex::new(Vec::new()),
            vars: Mutex::new(HashMap::new()),
            group: Mutex::new(None),
            members: Mutex::new(None),
            mtime_cache: Mutex::new(None),
            match_slot: tokio::sync::Mutex::new(None),
            exec_slot: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.dir.join(&self.name)
    }

    pub fn prerequisites(&self) -> Vec<Prerequisite> {
        self.prereqs.lock().unwrap().clone()
    }

    pub fn first_prerequisite(&self) -> Option<Arc<Target>> {
        self.prereqs
            .lock()
            .unwrap()
            .first()
            .map(|p| p.target.clone())
    }

    pub fn has_prerequisites(&self) -> bool {
        !self.prereqs.lock().unwrap().is_empty()
    }

    /// Assign this target's prerequisites if it has none yet. Returns
    /// false, leaving the existing list untouched, if someone (the user's
    /// declarations, or an earlier discovery of the same member) got
    /// there first; the caller is responsible for validating
    /// compatibility in that case. The assignment is atomic: no observer
    /// sees a partially filled list.
    pub fn try_init_prerequisites(&self, ps: Vec<Prerequisite>) -> bool {
        let mut guard = self.prereqs.lock().unwrap();
        if guard.is_empty() {
            *guard = ps;
            true
        } else {
            false
        }
    }

    /// Append a prerequisite to a target being declared. Intended for
    /// graph construction, before the target is matched.
    pub fn push_prerequisite(&self, p: Prerequisite) {
        self.prereqs.lock().unwrap().push(p);
    }

    pub fn set_var(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn var_strings(&self, key: &str) -> Option<Vec<String>> {
        match self.vars.lock().unwrap().get(key) {
            Some(Value::Strings(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn var_bool(&self, key: &str) -> Option<bool> {
        match self.vars.lock().unwrap().get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// The aggregate this target belongs to, if any.
    pub fn group(&self) -> Option<Arc<Target>> {
        self.group.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Link this target to its owning aggregate. Fails with the current
    /// owner if the target already belongs to a different group.
    pub fn set_group(self: &Arc<Self>, group: &Arc<Target>) -> Result<(), Arc<Target>> {
        let mut guard = self.group.lock().unwrap();
        if let Some(existing) = guard.as_ref().and_then(Weak::upgrade) {
            if Arc::ptr_eq(&existing, group) {
                return Ok(());
            }
            return Err(existing);
        }
        *guard = Some(Arc::downgrade(group));
        Ok(())
    }

    /// Record the discovered member list for `(op, seq)`.
    pub fn set_members(&self, op: Operation, seq: u64, list: Vec<Arc<Target>>) {
        *self.members.lock().unwrap() = Some(Members { op, seq, list });
    }

    /// The member list, if it was discovered for exactly `(op, seq)`.
    /// `Some(vec![])` is a legitimate "present but nothing discovered"
    /// state recorded by operations that do not perform discovery.
    pub fn members_for(&self, op: Operation, seq: u64) -> Option<Vec<Arc<Target>>> {
        match self.members.lock().unwrap().as_ref() {
            Some(m) if m.op == op && m.seq == seq => Some(m.list.clone()),
            _ => None,
        }
    }

    /// Modification time of the target's file, cached for the build
    /// invocation. `None` means the file does not exist.
    pub fn mtime(&self) -> Option<SystemTime> {
        let mut cache = self.mtime_cache.lock().unwrap();
        if let Some(t) = *cache {
            return t;
        }
        let t = crate::fsutil::mtime(&self.path());
        *cache = Some(t);
        t
    }

    /// Re-stat the target's file, replacing the cached value. Called
    /// after a generator has (re)written the file.
    pub fn refresh_mtime(&self) -> Option<SystemTime> {
        let t = crate::fsutil::mtime(&self.path());
        *self.mtime_cache.lock().unwrap() = Some(t);
        t
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.kind.tag(), self.path())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Identity-keyed arena of all targets in a build invocation.
#[derive(Default)]
pub struct Graph {
    targets: Mutex<HashMap<TargetKey, Arc<Target>>>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Look up the target with this identity, creating it if necessary.
    /// Returns the target and whether it was created by this call.
    pub fn search_or_create(
        &self,
        kind: FileKind,
        dir: &Utf8Path,
        name: &str,
    ) -> (Arc<Target>, bool) {
        let key = TargetKey {
            kind,
            dir: dir.to_owned(),
            name: name.to_owned(),
        };

        let mut targets = self.targets.lock().unwrap();
        if let Some(t) = targets.get(&key) {
            return (t.clone(), false);
        }

        let t = Arc::new(Target::new(kind, key.dir.clone(), key.name.clone()));
        targets.insert(key, t.clone());
        (t, true)
    }

    pub fn find(&self, kind: FileKind, dir: &Utf8Path, name: &str) -> Option<Arc<Target>> {
        let key = TargetKey {
            kind,
            dir: dir.to_owned(),
            name: name.to_owned(),
        };
        self.targets.lock().unwrap().get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp/proj")
    }

    #[test]
    fn search_or_create_is_idempotent() {
        let g = Graph::new();
        let (a, created_a) = g.search_or_create(FileKind::Header, &dir(), "widget.hxx");
        let (b, created_b) = g.search_or_create(FileKind::Header, &dir(), "widget.hxx");

        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn identity_includes_kind() {
        let g = Graph::new();
        let (a, _) = g.search_or_create(FileKind::Header, &dir(), "widget.hxx");
        let (b, _) = g.search_or_create(FileKind::Source, &dir(), "widget.hxx");

        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn prerequisites_initialize_once() {
        let g = Graph::new();
        let (t, _) = g.search_or_create(FileKind::MetaSource, &dir(), "moc_widget.cxx");
        let (p1, _) = g.search_or_create(FileKind::Header, &dir(), "widget.hxx");
        let (p2, _) = g.search_or_create(FileKind::Header, &dir(), "other.hxx");

        assert!(t.try_init_prerequisites(vec![Prerequisite::new(p1.clone())]));
        assert!(!t.try_init_prerequisites(vec![Prerequisite::new(p2)]));
        assert!(Arc::ptr_eq(&t.first_prerequisite().unwrap(), &p1));
    }

    #[test]
    fn group_link_rejects_second_owner() {
        let g = Graph::new();
        let (m, _) = g.search_or_create(FileKind::MetaSource, &dir(), "moc_widget.cxx");
        let (g1, _) = g.search_or_create(FileKind::AutomocGroup, &dir(), "meta");
        let (g2, _) = g.search_or_create(FileKind::AutomocGroup, &dir(), "other");

        assert!(m.set_group(&g1).is_ok());
        assert!(m.set_group(&g1).is_ok()); // Same owner is fine.
        let existing = m.set_group(&g2).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &g1));
    }

    #[test]
    fn members_are_operation_stamped() {
        let g = Graph::new();
        let (agg, _) = g.search_or_create(FileKind::AutomocGroup, &dir(), "meta");
        let (m, _) = g.search_or_create(FileKind::MetaSource, &dir(), "moc_widget.cxx");

        agg.set_members(Operation::Update, 1, vec![m]);

        assert_eq!(agg.members_for(Operation::Update, 1).map(|m| m.len()), Some(1));
        assert!(agg.members_for(Operation::Update, 2).is_none());
        assert!(agg.members_for(Operation::Clean, 1).is_none());
    }
}
