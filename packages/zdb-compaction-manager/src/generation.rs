//! GenerationStore - on-disk layout of data/index generations
//!
//! A backend root holds sibling directories `data-<N>` and `index-<N>`.
//! A generation `N` is valid only when both exist. Everything outside this
//! module sees generations as integers and paths; the name encoding stays here.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   data-3/
//!   index-3/
//!     ns1/zdb-namespace
//!     scratch/            (no marker, not a namespace)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use zdb_compaction_manager::generation::{GenerationStore, list_namespaces};
//!
//! let store = GenerationStore::new("./zdb");
//! let active = store.discover().unwrap();
//!
//! for ns in list_namespaces(&active.index_dir).unwrap() {
//!     println!("{} -> {:?}", ns.name, ns.template);
//! }
//!
//! let next = store.allocate(active.generation + 1).unwrap();
//! store.remove(&next).unwrap();
//! ```

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{ManagerError, Result};

/// Marker entry that turns an index subdirectory into a namespace
pub const NAMESPACE_MARKER: &str = "zdb-namespace";

const DATA_PREFIX: &str = "data-";
const INDEX_PREFIX: &str = "index-";

/// Paths of one generation pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationDirs {
    pub generation: u64,
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
}

/// Owns the generation directories under a backend root
#[derive(Debug, Clone)]
pub struct GenerationStore {
    root: PathBuf,
}

impl GenerationStore {
    /// Create a store for `root`. Nothing is touched on disk until `discover`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths for `generation`, whether or not they exist
    pub fn dirs(&self, generation: u64) -> GenerationDirs {
        GenerationDirs {
            generation,
            data_dir: self.root.join(format!("{DATA_PREFIX}{generation}")),
            index_dir: self.root.join(format!("{INDEX_PREFIX}{generation}")),
        }
    }

    /// Find the highest valid generation, creating generation 0 if there is none
    ///
    /// The root (and missing parents) is created first. Only directories
    /// count; a `data-K` without `index-K` (or the reverse) is ignored.
    pub fn discover(&self) -> Result<GenerationDirs> {
        fs::create_dir_all(&self.root)
            .map_err(|e| ManagerError::fs("create backend root", &self.root, e))?;

        let entries = fs::read_dir(&self.root)
            .map_err(|e| ManagerError::fs("list backend root", &self.root, e))?;

        let mut data_generations = HashSet::new();
        let mut index_generations = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| ManagerError::fs("list backend root", &self.root, e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| ManagerError::fs("stat", entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if let Some(generation) = parse_generation(name, INDEX_PREFIX) {
                index_generations.push(generation);
            } else if let Some(generation) = parse_generation(name, DATA_PREFIX) {
                data_generations.insert(generation);
            }
        }

        let highest = index_generations
            .into_iter()
            .filter(|generation| data_generations.contains(generation))
            .max();

        match highest {
            Some(generation) => {
                tracing::debug!(generation, root = ?self.root, "discovered generation");
                Ok(self.dirs(generation))
            }
            None => {
                let dirs = self.dirs(0);
                tracing::info!(root = ?self.root, "no generation found, creating generation 0");
                fs::create_dir_all(&dirs.data_dir)
                    .map_err(|e| ManagerError::fs("create", &dirs.data_dir, e))?;
                fs::create_dir_all(&dirs.index_dir)
                    .map_err(|e| ManagerError::fs("create", &dirs.index_dir, e))?;
                Ok(dirs)
            }
        }
    }

    /// Create the directory pair for `generation`
    ///
    /// Leftover halves from an interrupted earlier attempt are cleared first;
    /// a generation above the active one can never be a complete pair, since
    /// discovery would have picked it. On failure nothing created here survives.
    pub fn allocate(&self, generation: u64) -> Result<GenerationDirs> {
        let dirs = self.dirs(generation);

        for path in [&dirs.data_dir, &dirs.index_dir] {
            clear_leftover(path)?;
        }

        fs::create_dir_all(&dirs.data_dir)
            .map_err(|e| ManagerError::fs("create", &dirs.data_dir, e))
            .inspect_err(|_| cleanup(&dirs.data_dir))?;

        fs::create_dir_all(&dirs.index_dir)
            .map_err(|e| ManagerError::fs("create", &dirs.index_dir, e))
            .inspect_err(|_| {
                cleanup(&dirs.data_dir);
                cleanup(&dirs.index_dir);
            })?;

        Ok(dirs)
    }

    /// Recursively remove both directories of a generation
    ///
    /// Both removals are attempted; the first failure is returned.
    pub fn remove(&self, dirs: &GenerationDirs) -> Result<()> {
        let data = remove_dir_if_exists(&dirs.data_dir);
        let index = remove_dir_if_exists(&dirs.index_dir);
        data.and(index)
    }

    /// Best-effort removal used on rollback paths
    pub fn discard(&self, dirs: &GenerationDirs) {
        cleanup(&dirs.data_dir);
        cleanup(&dirs.index_dir);
    }
}

/// Parse `<prefix><decimal>` into a generation number
fn parse_generation(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ManagerError::fs("remove", path, e)),
    }
}

/// Remove whatever sits at `path`: a directory tree, a file or a symlink
fn clear_leftover(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ManagerError::fs("stat", path, e)),
    };

    tracing::warn!(path = ?path, "removing leftover entry before allocation");
    if meta.is_dir() {
        remove_dir_if_exists(path)
    } else {
        fs::remove_file(path).map_err(|e| ManagerError::fs("remove leftover file", path, e))
    }
}

fn cleanup(path: &Path) {
    if let Err(e) = remove_dir_if_exists(path) {
        tracing::warn!(error = %e, "cleanup failed");
    }
}

// ── Namespaces ──────────────────────────────────────────────────────

/// A namespace inside an index directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    /// Path of the marker file, handed to the reindexer as its template
    pub template: PathBuf,
}

/// Iterator over the namespaces of one index directory
///
/// The directory listing is taken when the iterator is created; marker
/// checks happen as it advances. Call `list_namespaces` again for a fresh
/// snapshot.
#[derive(Debug)]
pub struct Namespaces {
    index_dir: PathBuf,
    candidates: std::vec::IntoIter<String>,
}

impl Iterator for Namespaces {
    type Item = Namespace;

    fn next(&mut self) -> Option<Namespace> {
        loop {
            let name = self.candidates.next()?;
            let template = self.index_dir.join(&name).join(NAMESPACE_MARKER);
            if is_marker(&template) {
                return Some(Namespace { name, template });
            }
        }
    }
}

/// List namespaces of `index_dir` in lexicographic order
pub fn list_namespaces(index_dir: &Path) -> Result<Namespaces> {
    let entries = fs::read_dir(index_dir)
        .map_err(|e| ManagerError::fs("list index directory", index_dir, e))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ManagerError::fs("list index directory", index_dir, e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => candidates.push(name),
            Err(name) => tracing::warn!(name = ?name, "skipping non UTF-8 index entry"),
        }
    }
    candidates.sort();

    Ok(Namespaces {
        index_dir: index_dir.to_path_buf(),
        candidates: candidates.into_iter(),
    })
}

fn is_marker(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| !meta.is_dir())
        .unwrap_or(false)
}
