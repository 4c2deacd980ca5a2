//! Compaction procedure: builds generation N+1 from generation N.
//!
//! 1. Allocate `data-(N+1)` / `index-(N+1)`
//! 2. For every namespace of `index-N`, in order:
//!    compactor (`data-N` → `data-(N+1)`), then reindexer (`index-(N+1)`)
//! 3. Switch the active generation to N+1
//! 4. Remove `data-N` / `index-N`
//!
//! Any failure in 1–2 removes the new directories and leaves the active
//! generation untouched. A failure in 4 is reported, but the switch stands:
//! the old directories are then leftovers for the operator.
//!
//! Runs only while the server is stopped. Namespaces are processed one at a
//! time; the external tools are not assumed safe to run concurrently.

use std::time::Instant;

use crate::error::{ManagerError, Result};
use crate::generation::{list_namespaces, GenerationDirs};
use crate::state::BackendState;
use crate::tools::NamespaceTools;

/// Result of a successful compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub previous_generation: u64,
    pub generation: u64,
    /// Namespaces compacted, in processing order
    pub namespaces: Vec<String>,
    pub duration_ms: u64,
}

/// Compact the active generation into a new one
///
/// Fails with `CompactionInProgress` and touches nothing if the server is
/// still marked running. Fails the same way with `GenerationOverflow` when
/// the active generation is `u64::MAX`.
pub fn compact<T: NamespaceTools>(state: &mut BackendState, tools: &T) -> Result<CompactionReport> {
    if state.is_running() {
        return Err(ManagerError::CompactionInProgress);
    }

    let start = Instant::now();
    let current = state.active().clone();
    let next_generation = current
        .generation
        .checked_add(1)
        .ok_or(ManagerError::GenerationOverflow {
            generation: current.generation,
        })?;
    let next = state.store().allocate(next_generation)?;

    tracing::info!(
        from = current.generation,
        to = next.generation,
        "compacting generation"
    );

    let namespaces = match build_generation(&current, &next, tools) {
        Ok(namespaces) => namespaces,
        Err(e) => {
            tracing::warn!(generation = next.generation, error = %e, "rolling back new generation");
            state.store().discard(&next);
            return Err(e);
        }
    };

    let previous = state.switch_to(next);
    let report = CompactionReport {
        previous_generation: previous.generation,
        generation: state.generation(),
        namespaces,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    if let Err(e) = state.store().remove(&previous) {
        return Err(ManagerError::StaleGeneration {
            generation: report.generation,
            source: Box::new(e),
        });
    }

    Ok(report)
}

/// Run compactor + reindexer for every namespace of `current` into `next`
fn build_generation<T: NamespaceTools>(
    current: &GenerationDirs,
    next: &GenerationDirs,
    tools: &T,
) -> Result<Vec<String>> {
    let mut done = Vec::new();

    for namespace in list_namespaces(&current.index_dir)? {
        tracing::debug!(namespace = %namespace.name, "compacting namespace");
        tools.compact_namespace(&current.data_dir, next, &namespace)?;
        tools.reindex_namespace(next, &namespace)?;
        done.push(namespace.name);
    }

    Ok(done)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{Namespace, NAMESPACE_MARKER};
    use std::cell::RefCell;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Compact {
            source: PathBuf,
            target: PathBuf,
            namespace: String,
        },
        Reindex {
            data: PathBuf,
            index: PathBuf,
            namespace: String,
            template: PathBuf,
        },
    }

    /// Records invocations and writes a file per namespace, like the real tools do
    #[derive(Default)]
    struct FakeTools {
        calls: RefCell<Vec<Call>>,
        fail_compact: Option<&'static str>,
        fail_reindex: Option<&'static str>,
        /// Replace the source index directory with a plain file after reindexing
        clobber_source_index: bool,
    }

    fn failure(namespace: &str, tool: &'static str) -> ManagerError {
        ManagerError::Launch {
            tool,
            bin: PathBuf::from(tool),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("{namespace} failed")),
        }
    }

    impl NamespaceTools for FakeTools {
        fn compact_namespace(
            &self,
            source_data: &Path,
            target: &GenerationDirs,
            namespace: &Namespace,
        ) -> Result<()> {
            self.calls.borrow_mut().push(Call::Compact {
                source: source_data.to_path_buf(),
                target: target.data_dir.clone(),
                namespace: namespace.name.clone(),
            });
            if self.fail_compact == Some(namespace.name.as_str()) {
                return Err(failure(&namespace.name, "compactor"));
            }
            fs::create_dir_all(target.data_dir.join(&namespace.name)).unwrap();
            Ok(())
        }

        fn reindex_namespace(&self, target: &GenerationDirs, namespace: &Namespace) -> Result<()> {
            self.calls.borrow_mut().push(Call::Reindex {
                data: target.data_dir.clone(),
                index: target.index_dir.clone(),
                namespace: namespace.name.clone(),
                template: namespace.template.clone(),
            });
            if self.fail_reindex == Some(namespace.name.as_str()) {
                return Err(failure(&namespace.name, "reindexer"));
            }
            let ns_dir = target.index_dir.join(&namespace.name);
            fs::create_dir_all(&ns_dir).unwrap();
            fs::copy(&namespace.template, ns_dir.join(NAMESPACE_MARKER)).unwrap();
            if self.clobber_source_index {
                let source_index = namespace.template.parent().unwrap().parent().unwrap();
                fs::remove_dir_all(source_index).unwrap();
                fs::write(source_index, b"not a directory").unwrap();
            }
            Ok(())
        }
    }

    fn make_generation(root: &Path, generation: u64, namespaces: &[&str]) {
        let data = root.join(format!("data-{generation}"));
        let index = root.join(format!("index-{generation}"));
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(&index).unwrap();
        for ns in namespaces {
            fs::create_dir_all(index.join(ns)).unwrap();
            fs::write(index.join(ns).join(NAMESPACE_MARKER), ns.as_bytes()).unwrap();
            fs::create_dir_all(data.join(ns)).unwrap();
        }
    }

    #[test]
    fn test_compact_empty_generation() {
        let dir = tempdir().unwrap();
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools::default();

        let report = compact(&mut state, &tools).unwrap();

        assert_eq!(report.previous_generation, 0);
        assert_eq!(report.generation, 1);
        assert!(report.namespaces.is_empty());
        assert!(tools.calls.borrow().is_empty());
        assert_eq!(state.generation(), 1);
        assert!(!dir.path().join("data-0").exists());
        assert!(!dir.path().join("index-0").exists());
        assert_eq!(fs::read_dir(state.data_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(state.index_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_compact_skips_unmarked_directories() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 3, &["ns1"]);
        fs::create_dir(dir.path().join("index-3").join("scratch")).unwrap();
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools::default();

        let report = compact(&mut state, &tools).unwrap();

        assert_eq!(report.namespaces, vec!["ns1"]);
        let root = dir.path();
        assert_eq!(
            *tools.calls.borrow(),
            vec![
                Call::Compact {
                    source: root.join("data-3"),
                    target: root.join("data-4"),
                    namespace: "ns1".to_string(),
                },
                Call::Reindex {
                    data: root.join("data-4"),
                    index: root.join("index-4"),
                    namespace: "ns1".to_string(),
                    template: root.join("index-3").join("ns1").join(NAMESPACE_MARKER),
                },
            ]
        );
    }

    #[test]
    fn test_compact_populates_new_generation() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["alpha", "beta"]);
        let mut state = BackendState::open(dir.path()).unwrap();

        compact(&mut state, &FakeTools::default()).unwrap();

        assert_eq!(state.generation(), 1);
        for ns in ["alpha", "beta"] {
            assert!(state.data_dir().join(ns).is_dir());
            assert!(state.index_dir().join(ns).join(NAMESPACE_MARKER).is_file());
        }
        assert!(!dir.path().join("index-0").exists());
    }

    #[test]
    fn test_compact_processes_namespaces_in_order() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["c", "a", "b"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools::default();

        compact(&mut state, &tools).unwrap();

        let order: Vec<String> = tools
            .calls
            .borrow()
            .iter()
            .map(|call| match call {
                Call::Compact { namespace, .. } => format!("compact:{namespace}"),
                Call::Reindex { namespace, .. } => format!("reindex:{namespace}"),
            })
            .collect();
        assert_eq!(
            order,
            vec!["compact:a", "reindex:a", "compact:b", "reindex:b", "compact:c", "reindex:c"]
        );
    }

    #[test]
    fn test_compactor_failure_rolls_back() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 2, &["ns1", "ns2"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools {
            fail_compact: Some("ns2"),
            ..FakeTools::default()
        };

        let result = compact(&mut state, &tools);

        assert!(matches!(result, Err(ManagerError::Launch { tool: "compactor", .. })));
        assert_eq!(state.generation(), 2);
        assert!(!dir.path().join("data-3").exists());
        assert!(!dir.path().join("index-3").exists());
        assert!(dir.path().join("data-2").join("ns1").is_dir());
        assert!(dir.path().join("index-2").join("ns2").join(NAMESPACE_MARKER).is_file());
    }

    #[test]
    fn test_reindexer_failure_rolls_back() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools {
            fail_reindex: Some("ns1"),
            ..FakeTools::default()
        };

        let result = compact(&mut state, &tools);

        assert!(matches!(result, Err(ManagerError::Launch { tool: "reindexer", .. })));
        assert_eq!(state.generation(), 0);
        assert!(!dir.path().join("data-1").exists());
        assert!(!dir.path().join("index-1").exists());
        assert_eq!(tools.calls.borrow().len(), 2);
    }

    #[test]
    fn test_failed_compaction_can_be_retried() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();

        let failing = FakeTools {
            fail_compact: Some("ns1"),
            ..FakeTools::default()
        };
        assert!(compact(&mut state, &failing).is_err());

        let report = compact(&mut state, &FakeTools::default()).unwrap();
        assert_eq!(report.generation, 1);
    }

    #[test]
    fn test_compact_refused_while_running() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        state.set_running(true);
        let tools = FakeTools::default();

        let result = compact(&mut state, &tools);

        assert!(matches!(result, Err(ManagerError::CompactionInProgress)));
        assert_eq!(state.generation(), 0);
        assert!(tools.calls.borrow().is_empty());
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["data-0", "index-0"]);
    }

    #[test]
    fn test_successive_compactions_are_monotonic() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 0, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();

        for expected in 1..=3 {
            let report = compact(&mut state, &FakeTools::default()).unwrap();
            assert_eq!(report.generation, expected);
            assert_eq!(report.previous_generation, expected - 1);
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_compact_refuses_generation_overflow() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), u64::MAX, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        assert_eq!(state.generation(), u64::MAX);
        let tools = FakeTools::default();

        let result = compact(&mut state, &tools);

        assert!(matches!(
            result,
            Err(ManagerError::GenerationOverflow { generation: u64::MAX })
        ));
        assert_eq!(state.generation(), u64::MAX);
        assert!(tools.calls.borrow().is_empty());
        assert!(!dir.path().join("data-0").exists());
        assert!(dir.path().join(format!("data-{}", u64::MAX)).is_dir());
        assert!(dir.path().join(format!("index-{}", u64::MAX)).is_dir());
    }

    #[test]
    fn test_failed_cleanup_keeps_switch() {
        let dir = tempdir().unwrap();
        make_generation(dir.path(), 4, &["ns1"]);
        let mut state = BackendState::open(dir.path()).unwrap();
        let tools = FakeTools {
            clobber_source_index: true,
            ..FakeTools::default()
        };

        let result = compact(&mut state, &tools);

        match result {
            Err(ManagerError::StaleGeneration { generation, source }) => {
                assert_eq!(generation, 5);
                assert!(matches!(*source, ManagerError::Fs { op: "remove", .. }));
            }
            other => panic!("expected StaleGeneration, got {other:?}"),
        }
        assert_eq!(state.generation(), 5);
        assert!(dir.path().join("data-5").join("ns1").is_dir());
        assert!(dir.path().join("index-5").join("ns1").join(NAMESPACE_MARKER).is_file());
        assert!(!dir.path().join("data-4").exists());
        assert!(dir.path().join("index-4").is_file());
    }
}
