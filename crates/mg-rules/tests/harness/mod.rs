//! Shared harness for the rules integration tests.
//!
//! Each test gets an isolated temp directory and fake generator
//! executables (shell scripts) standing in for moc/rcc/uic: they honor
//! the invocation contract (`-o`, input path, byproduct depfile for
//! moc), log every invocation next to the binary, and derive the moc
//! depfile from the input's `#include "..."` lines so auxiliary
//! dependency tracking can be exercised without a real toolchain.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use camino::Utf8PathBuf;
use tempfile::TempDir;

use mg_engine::{Engine, Vars};
use mg_rules::{rules, AutomocRule, Tool};

const MOC_SCRIPT: &str = r#"#!/bin/sh
echo "$*" >> "$0.args"
out=; dep=; last=
while [ $# -gt 0 ]; do
  case "$1" in
    --dep-file-path) dep="$2"; shift 2 ;;
    --output-dep-file) shift ;;
    -o) out="$2"; shift 2 ;;
    *) last="$1"; shift ;;
  esac
done
in="$last"
echo "// generated by fake moc from $in" > "$out"
if [ -n "$dep" ]; then
  deps="$in"
  for inc in $(grep -o '#include "[^"]*"' "$in" | sed 's/.*"\(.*\)"/\1/'); do
    deps="$deps $(dirname "$in")/$inc"
  done
  echo "$out: $deps" > "$dep"
fi
"#;

const RCC_SCRIPT: &str = r#"#!/bin/sh
echo "$*" >> "$0.args"
out=; last=
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) last="$1"; shift ;;
  esac
done
echo "// compiled resources from $last" > "$out"
"#;

const UIC_SCRIPT: &str = r#"#!/bin/sh
echo "$*" >> "$0.args"
out=; last=
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) last="$1"; shift ;;
  esac
done
echo "// generated ui header from $last" > "$out"
"#;

pub const FAILING_SCRIPT: &str = "#!/bin/sh\nexit 3\n";

pub struct TestEnv {
    _tmp: TempDir,
    pub dir: Utf8PathBuf,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let tmp = TempDir::new().expect("create temp dir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).expect("utf-8 temp dir");
        TestEnv { _tmp: tmp, dir }
    }

    pub fn path(&self, rel: &str) -> Utf8PathBuf {
        self.dir.join(rel)
    }

    /// Write a file, backdated a few seconds so that everything the
    /// build itself writes is strictly newer.
    pub fn write_file(&self, rel: &str, content: &str) -> Utf8PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, content).expect("write file");

        let file = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("open for backdating");
        file.set_modified(SystemTime::now() - Duration::from_secs(5))
            .expect("backdate");

        path
    }

    pub fn read_file(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path(rel)).expect("read file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    /// Mark a file as edited now (newer than any ledger so far).
    pub fn touch(&self, rel: &str) {
        let file = std::fs::File::options()
            .write(true)
            .open(self.path(rel))
            .expect("open for touch");
        file.set_modified(SystemTime::now()).expect("touch");
    }

    pub fn install_tool(&self, name: &'static str, script: &str) -> Tool {
        let path = self.write_file(&format!("bin/{name}"), script);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).expect("stat tool").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod tool");
        }

        Tool::from_program(name, path).expect("hash tool")
    }

    /// How many times the fake tool has been invoked.
    pub fn invocations(&self, tool: &Tool) -> usize {
        match std::fs::read_to_string(format!("{}.args", tool.program())) {
            Ok(log) => log.lines().count(),
            Err(_) => 0,
        }
    }

    /// The full invocation log of the fake tool.
    pub fn args_log(&self, tool: &Tool) -> String {
        std::fs::read_to_string(format!("{}.args", tool.program())).unwrap_or_default()
    }
}

/// An isolated environment plus the three fake generators.
pub struct Setup {
    pub env: TestEnv,
    pub moc: Tool,
    pub rcc: Tool,
    pub uic: Tool,
}

impl Setup {
    pub fn new() -> Setup {
        let env = TestEnv::new();
        let moc = env.install_tool("moc", MOC_SCRIPT);
        let rcc = env.install_tool("rcc", RCC_SCRIPT);
        let uic = env.install_tool("uic", UIC_SCRIPT);
        Setup { env, moc, rcc, uic }
    }

    /// A fresh engine (fresh graph, fresh invocation counter) over the
    /// same directory and tools — a new "build" in the same project.
    pub fn engine(&self) -> (Arc<Engine>, Arc<AutomocRule>) {
        self.engine_with(Vars::new())
    }

    pub fn engine_with(&self, vars: Vars) -> (Arc<Engine>, Arc<AutomocRule>) {
        let (automoc, registry) = rules(self.moc.clone(), self.rcc.clone(), self.uic.clone());
        (Engine::new(vars, registry), automoc)
    }
}
