//! External programs driven by the manager
//!
//! Three executables do the storage work: the server (`zdb`), the
//! per-namespace compactor (`zdb-compaction`) and the per-namespace
//! reindexer (`index-rebuild`). They are judged only by exit status.
//! Stdout and stderr are inherited so their output lands in the manager's log.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::error::{ManagerError, Result};
use crate::generation::{GenerationDirs, Namespace};

pub const SERVER_BIN: &str = "zdb";
pub const COMPACTOR_BIN: &str = "zdb-compaction";
pub const REINDEXER_BIN: &str = "index-rebuild";

/// Listen and tuning parameters passed to every server launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub listen_address: String,
    pub listen_port: u16,
    pub mode: Option<String>,
    pub datasize: Option<String>,
    pub verbose: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9900,
            mode: None,
            datasize: None,
            verbose: false,
        }
    }
}

impl ServerSettings {
    /// Server arguments for the given generation
    pub fn args(&self, dirs: &GenerationDirs) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--data".into(),
            dirs.data_dir.clone().into(),
            "--index".into(),
            dirs.index_dir.clone().into(),
            "--listen".into(),
            self.listen_address.clone().into(),
            "--port".into(),
            self.listen_port.to_string().into(),
        ];

        if let Some(mode) = non_empty(&self.mode) {
            args.push("--mode".into());
            args.push(mode.into());
        }
        if let Some(datasize) = non_empty(&self.datasize) {
            args.push("--datasize".into());
            args.push(datasize.into());
        }
        if self.verbose {
            args.push("--verbose".into());
        }

        args
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Locations of the three executables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub server: PathBuf,
    pub compactor: PathBuf,
    pub reindexer: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            server: PathBuf::from(SERVER_BIN),
            compactor: PathBuf::from(COMPACTOR_BIN),
            reindexer: PathBuf::from(REINDEXER_BIN),
        }
    }
}

impl Toolchain {
    /// Launch the server against `dirs`. Returns once the process is spawned.
    ///
    /// SIGINT is restored to its default disposition in the child: a manager
    /// started in the background inherits it ignored, and the server must
    /// still stop when interrupted for compaction.
    pub fn spawn_server(&self, settings: &ServerSettings, dirs: &GenerationDirs) -> Result<Child> {
        let mut command = Command::new(&self.server);
        command.args(settings.args(dirs)).stdin(Stdio::null());

        // SAFETY: signal(2) is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                Ok(())
            });
        }

        command
            .spawn()
            .map_err(|source| ManagerError::Launch {
                tool: "server",
                bin: self.server.clone(),
                source,
            })
    }
}

/// Per-namespace steps of a compaction
pub trait NamespaceTools {
    /// Compact one namespace from `source_data` into the target generation's data directory
    fn compact_namespace(
        &self,
        source_data: &Path,
        target: &GenerationDirs,
        namespace: &Namespace,
    ) -> Result<()>;

    /// Rebuild the index of one namespace inside the target generation
    ///
    /// The template is the namespace marker from the *old* index directory.
    fn reindex_namespace(&self, target: &GenerationDirs, namespace: &Namespace) -> Result<()>;
}

impl NamespaceTools for Toolchain {
    fn compact_namespace(
        &self,
        source_data: &Path,
        target: &GenerationDirs,
        namespace: &Namespace,
    ) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--data".into(),
            source_data.into(),
            "--target".into(),
            target.data_dir.clone().into(),
            "--namespace".into(),
            namespace.name.clone().into(),
        ];
        run_to_completion("compactor", &self.compactor, &args, &namespace.name)
    }

    fn reindex_namespace(&self, target: &GenerationDirs, namespace: &Namespace) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--data".into(),
            target.data_dir.clone().into(),
            "--index".into(),
            target.index_dir.clone().into(),
            "--namespace".into(),
            namespace.name.clone().into(),
            "--template".into(),
            namespace.template.clone().into(),
        ];
        run_to_completion("reindexer", &self.reindexer, &args, &namespace.name)
    }
}

fn run_to_completion(tool: &'static str, bin: &Path, args: &[OsString], namespace: &str) -> Result<()> {
    tracing::debug!(tool, ?bin, namespace, "running");

    let status = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .map_err(|source| ManagerError::Launch {
            tool,
            bin: bin.to_path_buf(),
            source,
        })?;

    if !status.success() {
        return Err(ManagerError::ToolFailed {
            tool,
            namespace: namespace.to_string(),
            status,
        });
    }
    Ok(())
}
