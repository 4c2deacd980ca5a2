//! Error types for the compaction manager

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("{op} {path:?}: {source}")]
    Fs {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {tool} ({bin:?}): {source}")]
    Launch {
        tool: &'static str,
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed for namespace '{namespace}': {status}")]
    ToolFailed {
        tool: &'static str,
        namespace: String,
        status: ExitStatus,
    },

    #[error("Failed to {op}: {source}")]
    Process {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Compaction refused: server is still running")]
    CompactionInProgress,

    #[error("Generation {generation} switched in, but removing the old generation failed: {source}")]
    StaleGeneration {
        generation: u64,
        #[source]
        source: Box<ManagerError>,
    },

    #[error("Generation {generation} is the last representable generation, cannot allocate a successor")]
    GenerationOverflow { generation: u64 },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid schedule '{expr}': {reason}")]
    Schedule { expr: String, reason: String },
}

impl ManagerError {
    /// Stable identifier for log aggregation
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::Fs { .. } => "FS_ERROR",
            ManagerError::Launch { .. } => "LAUNCH_FAILED",
            ManagerError::ToolFailed { .. } => "TOOL_FAILED",
            ManagerError::Process { .. } => "PROCESS_ERROR",
            ManagerError::CompactionInProgress => "COMPACTION_IN_PROGRESS",
            ManagerError::StaleGeneration { .. } => "STALE_GENERATION",
            ManagerError::GenerationOverflow { .. } => "GENERATION_OVERFLOW",
            ManagerError::Config(_) => "CONFIG_ERROR",
            ManagerError::Schedule { .. } => "INVALID_SCHEDULE",
        }
    }

    pub(crate) fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ManagerError::Fs {
            op,
            path: path.into(),
            source,
        }
    }
}
