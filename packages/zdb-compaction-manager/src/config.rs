//! Manager configuration, loaded from YAML
//!
//! ```yaml
//! schedule: "0 0 3 * * *"      # required, see `schedule` for the accepted forms
//! backend_dir: /var/lib/zdb    # default ./zdb
//! listen_address: 0.0.0.0      # default 0.0.0.0
//! listen_port: 9900            # default 9900
//! mode: seq                    # optional
//! data_size: "33554432"        # optional
//! verbose: false
//! binaries:                    # optional, looked up in PATH by default
//!   server: /usr/local/bin/zdb
//!   compactor: /usr/local/bin/zdb-compaction
//!   reindexer: /usr/local/bin/index-rebuild
//! ```
//!
//! Empty strings count as unset and fall back to the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::error::{ManagerError, Result};
use crate::schedule::CompactionSchedule;
use crate::tools::{ServerSettings, Toolchain, COMPACTOR_BIN, REINDEXER_BIN, SERVER_BIN};

pub const DEFAULT_BACKEND_DIR: &str = "./zdb";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 9900;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub schedule: String,
    pub backend_dir: PathBuf,
    pub listen_address: String,
    #[serde(deserialize_with = "port")]
    pub listen_port: u16,
    pub mode: Option<String>,
    pub data_size: Option<String>,
    pub verbose: bool,
    pub binaries: Binaries,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            schedule: String::new(),
            backend_dir: PathBuf::from(DEFAULT_BACKEND_DIR),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            mode: None,
            data_size: None,
            verbose: false,
            binaries: Binaries::default(),
        }
    }
}

/// Paths of the external programs
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Binaries {
    pub server: PathBuf,
    pub compactor: PathBuf,
    pub reindexer: PathBuf,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            server: PathBuf::from(SERVER_BIN),
            compactor: PathBuf::from(COMPACTOR_BIN),
            reindexer: PathBuf::from(REINDEXER_BIN),
        }
    }
}

impl ManagerConfig {
    /// Read, default and validate a YAML config file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ManagerError::fs("read config", path, e))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut config: ManagerConfig =
            serde_yaml::from_str(raw).map_err(|e| ManagerError::Config(e.to_string()))?;
        config.validate()?;
        config.apply_defaults();
        Ok(config)
    }

    /// The schedule is required and must parse
    pub fn validate(&self) -> Result<()> {
        if self.schedule.trim().is_empty() {
            return Err(ManagerError::Config("empty schedule".to_string()));
        }
        CompactionSchedule::parse(&self.schedule)?;
        Ok(())
    }

    fn apply_defaults(&mut self) {
        let defaults = ManagerConfig::default();

        if self.backend_dir.as_os_str().is_empty() {
            self.backend_dir = defaults.backend_dir;
        }
        if self.listen_address.is_empty() {
            self.listen_address = defaults.listen_address;
        }
        if self.binaries.server.as_os_str().is_empty() {
            self.binaries.server = defaults.binaries.server;
        }
        if self.binaries.compactor.as_os_str().is_empty() {
            self.binaries.compactor = defaults.binaries.compactor;
        }
        if self.binaries.reindexer.as_os_str().is_empty() {
            self.binaries.reindexer = defaults.binaries.reindexer;
        }
        self.mode = self.mode.take().filter(|m| !m.is_empty());
        self.data_size = self.data_size.take().filter(|d| !d.is_empty());
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            mode: self.mode.clone(),
            datasize: self.data_size.clone(),
            verbose: self.verbose,
        }
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            server: self.binaries.server.clone(),
            compactor: self.binaries.compactor.clone(),
            reindexer: self.binaries.reindexer.clone(),
        }
    }
}

/// Accept the port as a number or a string; an empty string means the default
fn port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) if text.trim().is_empty() => Ok(DEFAULT_LISTEN_PORT),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid listen_port '{text}'"))),
    }
}
