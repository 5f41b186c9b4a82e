//! Worker configuration.
//!
//! Everything the worker needs to find its boss comes from the process
//! environment. A missing or malformed value is a bootstrap failure.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::executor::ExecutorConfig;

/// Names of the environment variables the worker reads.
pub mod env {
    /// Directory holding the boss socket.
    pub const SERVER_ADDRESS: &str = "SERVER_ADDRESS";
    /// Port number of the boss; part of the socket file name.
    pub const SERVER_PORT: &str = "SERVER_PORT";
    /// Job descriptor announced in the first `info` message.
    pub const QDESC: &str = "QDESC";
    /// Root directory for data sources opened by map-phase jobs.
    pub const FILES_ROOT: &str = "EMPLOYEE_FILES_ROOT";
    /// Directory of upstream job results (`<jid>.json`) for reduce-phase jobs.
    pub const RESULTS_DIR: &str = "EMPLOYEE_RESULTS_DIR";
}

/// Errors from reading the environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("please set the {0} environment variable")]
    Missing(&'static str),

    #[error("{name} environment variable is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Unvalidated settings, one per environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    pub server_address: Option<String>,
    pub server_port: Option<String>,
    pub qdesc: Option<String>,
    pub files_root: Option<String>,
    pub results_dir: Option<String>,
}

/// Worker configuration settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory holding the boss socket.
    pub server_address: PathBuf,
    /// Boss port.
    pub server_port: u16,
    /// Job descriptor for the `info` handshake.
    pub qdesc: String,
    /// Data-source root for the standalone execution context.
    pub files_root: Option<PathBuf>,
    /// Upstream results directory for the standalone execution context.
    pub results_dir: Option<PathBuf>,
    /// Job executor settings.
    pub executor: ExecutorConfig,
}

impl WorkerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_source(ConfigSource {
            server_address: lookup(env::SERVER_ADDRESS),
            server_port: lookup(env::SERVER_PORT),
            qdesc: lookup(env::QDESC),
            files_root: lookup(env::FILES_ROOT),
            results_dir: lookup(env::RESULTS_DIR),
        })
    }

    /// Validate raw settings. Empty values count as missing.
    pub fn from_source(source: ConfigSource) -> ConfigResult<Self> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.is_empty())
        }

        let server_address =
            PathBuf::from(present(source.server_address).ok_or(ConfigError::Missing(env::SERVER_ADDRESS))?);
        let port = present(source.server_port).ok_or(ConfigError::Missing(env::SERVER_PORT))?;
        let server_port = port.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
            name: env::SERVER_PORT,
            reason: format!("{:?} is not a port number: {}", port, e),
        })?;
        let qdesc = present(source.qdesc).ok_or(ConfigError::Missing(env::QDESC))?;

        Ok(Self {
            server_address,
            server_port,
            qdesc,
            files_root: present(source.files_root).map(PathBuf::from),
            results_dir: present(source.results_dir).map(PathBuf::from),
            executor: ExecutorConfig::default(),
        })
    }

    /// Path of the boss socket: `<SERVER_ADDRESS>/boss-<SERVER_PORT>.sock`.
    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.server_address, self.server_port)
    }
}

pub fn socket_path(directory: &Path, port: u16) -> PathBuf {
    directory.join(format!("boss-{}.sock", port))
}
