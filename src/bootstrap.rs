//! Process bootstrap.
//!
//! Connects to the boss socket, announces the job descriptor and waits for
//! `setup`. Any failure here ends the process with status 1.

use std::fs::File;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use employee_channel::{Channel, ChannelError};
use employee_protocol::{ControlMessage, Report, Setup};
use thiserror::Error;

use crate::config::{ConfigError, WorkerConfig};
use crate::log::LogContext;

/// Errors before the control loop starts.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("expected setup as the first message, got {0}")]
    Handshake(String),
}

/// Result type for bootstrap.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Open a channel on the boss socket at `path`.
pub fn connect(path: &Path) -> BootstrapResult<Channel> {
    let socket = UnixStream::connect(path).map_err(|source| BootstrapError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Channel::open(socket)?)
}

/// Send `info` and wait for the boss's `setup`.
pub fn handshake(channel: &Channel, qdesc: &str) -> BootstrapResult<Setup> {
    channel.report(Report::Info {
        qdesc: qdesc.to_string(),
    })?;
    match ControlMessage::try_from(channel.read()?) {
        Ok(ControlMessage::Setup(setup)) => Ok(setup),
        Ok(other) => Err(BootstrapError::Handshake(other.name().to_string())),
        Err(e) => Err(BootstrapError::Handshake(e.to_string())),
    }
}

/// Connect, handshake and attach the diagnostic log.
pub fn start(config: &WorkerConfig, log: &LogContext) -> BootstrapResult<Channel> {
    let path = config.socket_path();
    let channel = connect(&path)?;
    let setup = handshake(&channel, &config.qdesc)?;
    log.set_diagnostic(File::from(setup.log));
    tracing::info!(
        path = %path.display(),
        hostname = ?setup.hostname,
        pid = std::process::id(),
        "connected to boss"
    );
    Ok(channel)
}
