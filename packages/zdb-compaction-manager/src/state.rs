//! BackendState - the manager's view of the backend
//!
//! Holds the generation store, the active generation and whether the
//! server process is alive. Owned by the supervisor and handed by `&mut`
//! to the compaction procedure; nothing else mutates it.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::generation::{GenerationDirs, GenerationStore};

#[derive(Debug)]
pub struct BackendState {
    store: GenerationStore,
    active: GenerationDirs,
    running: bool,
}

impl BackendState {
    /// Resolve the active generation under `root`, creating generation 0 if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = GenerationStore::new(root);
        let active = store.discover()?;
        Ok(Self {
            store,
            active,
            running: false,
        })
    }

    pub fn store(&self) -> &GenerationStore {
        &self.store
    }

    pub fn active(&self) -> &GenerationDirs {
        &self.active
    }

    pub fn generation(&self) -> u64 {
        self.active.generation
    }

    pub fn data_dir(&self) -> &Path {
        &self.active.data_dir
    }

    pub fn index_dir(&self) -> &Path {
        &self.active.index_dir
    }

    /// True between server spawn and observed exit
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Record whether the server process is alive
    ///
    /// Only the supervisor loop calls this, right after spawn and right
    /// after the exit is observed.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Make `next` the active generation and return the previous one
    pub(crate) fn switch_to(&mut self, next: GenerationDirs) -> GenerationDirs {
        std::mem::replace(&mut self.active, next)
    }
}
