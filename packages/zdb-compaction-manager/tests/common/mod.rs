//! Stub executables standing in for zdb, zdb-compaction and index-rebuild.
//!
//! Every stub appends one line (`<tool> <args...>`) to a shared log so tests
//! can assert on invocation order and arguments.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use zdb_compaction_manager::{Toolchain, NAMESPACE_MARKER};

pub struct Stubs {
    pub log: PathBuf,
    pub toolchain: Toolchain,
}

/// Behaviour of the stub server
pub struct ServerBehaviour {
    /// Runs that block until interrupted
    pub blocking_runs: usize,
    /// Exit code of every later run
    pub exit_code: i32,
}

pub fn write_stubs(
    dir: &Path,
    server: ServerBehaviour,
    compactor_exit: i32,
    reindexer_exit: i32,
) -> Stubs {
    let log = dir.join("calls.log");
    fs::write(&log, b"").unwrap();
    let log_str = log.display();

    let server_bin = write_script(
        dir,
        "zdb",
        &format!(
            r#"echo "server $*" >> "{log_str}"
runs=$(grep -c '^server' "{log_str}")
if [ "$runs" -gt {blocking} ]; then
    exit {code}
fi
exec sleep 30
"#,
            blocking = server.blocking_runs,
            code = server.exit_code,
        ),
    );

    let compactor_bin = write_script(
        dir,
        "zdb-compaction",
        &format!(
            r#"echo "compactor $*" >> "{log_str}"
while [ $# -gt 0 ]; do
    case "$1" in
        --target) target="$2"; shift 2 ;;
        --namespace) ns="$2"; shift 2 ;;
        *) shift ;;
    esac
done
mkdir -p "$target/$ns"
exit {compactor_exit}
"#
        ),
    );

    let reindexer_bin = write_script(
        dir,
        "index-rebuild",
        &format!(
            r#"echo "reindexer $*" >> "{log_str}"
while [ $# -gt 0 ]; do
    case "$1" in
        --index) index="$2"; shift 2 ;;
        --namespace) ns="$2"; shift 2 ;;
        --template) template="$2"; shift 2 ;;
        *) shift ;;
    esac
done
mkdir -p "$index/$ns"
cp "$template" "$index/$ns/{NAMESPACE_MARKER}"
exit {reindexer_exit}
"#
        ),
    );

    Stubs {
        log,
        toolchain: Toolchain {
            server: server_bin,
            compactor: compactor_bin,
            reindexer: reindexer_bin,
        },
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn log_lines(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn lines_of(log: &Path, tool: &str) -> Vec<String> {
    let prefix = format!("{tool} ");
    log_lines(log)
        .into_iter()
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

/// Wait until `tool` has logged at least `count` invocations
pub fn wait_for_calls(log: &Path, tool: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while lines_of(log, tool).len() < count {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {count} {tool} calls, log: {:?}",
            log_lines(log)
        );
        thread::sleep(Duration::from_millis(20));
    }
}

pub fn make_generation(root: &Path, generation: u64, namespaces: &[&str]) {
    let data = root.join(format!("data-{generation}"));
    let index = root.join(format!("index-{generation}"));
    fs::create_dir_all(&data).unwrap();
    fs::create_dir_all(&index).unwrap();
    for ns in namespaces {
        fs::create_dir_all(data.join(ns)).unwrap();
        fs::create_dir_all(index.join(ns)).unwrap();
        fs::write(index.join(ns).join(NAMESPACE_MARKER), ns.as_bytes()).unwrap();
    }
}

pub fn dir_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}
