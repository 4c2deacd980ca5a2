//! zdb-compaction-manager
//!
//! Keeps a 0-db server running against the active data/index generation and,
//! on a cron schedule, stops it, compacts every namespace into a new
//! generation with the external `zdb-compaction` and `index-rebuild` tools,
//! and restarts it.
//!
//! - [`generation`]: `data-N` / `index-N` layout, discovery, namespaces
//! - [`compaction`]: builds generation N+1 with rollback
//! - [`supervisor`]: server run loop and the cross-thread [`CompactionTrigger`]
//! - [`schedule`]: cron thread firing the trigger
//! - [`config`]: YAML configuration
//!
//! Unix only: the server is interrupted with SIGINT.

pub mod compaction;
pub mod config;
pub mod error;
pub mod generation;
pub mod schedule;
pub mod state;
pub mod supervisor;
pub mod tools;

pub use compaction::{compact, CompactionReport};
pub use config::ManagerConfig;
pub use error::{ManagerError, Result};
pub use generation::{list_namespaces, GenerationDirs, GenerationStore, Namespace, NAMESPACE_MARKER};
pub use schedule::{CompactionSchedule, SchedulerHandle};
pub use state::BackendState;
pub use supervisor::{CompactionTrigger, ExitReason, ServerPhase, Supervisor};
pub use tools::{NamespaceTools, ServerSettings, Toolchain};
