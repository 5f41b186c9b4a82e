//! Control loop.
//!
//! Reads boss messages one at a time and dispatches them. Descriptor
//! messages rewire logging and standard streams, `assign` runs a job and
//! `die` ends the loop. Jobs never overlap: the next message is only read
//! after the previous job has reported.

use std::fs::File;
use std::os::fd::OwnedFd;

use employee_channel::{Channel, ChannelError};
use employee_protocol::{AssignMessage, ControlMessage, Setup};

use crate::crash::CrashReporter;
use crate::executor::{Disposition, Executor, TerminateReason};
use crate::log::LogContext;
use crate::stdio::{StdioRedirects, Stream};

/// Why the control loop returned.
#[derive(Debug)]
pub enum LoopExit {
    /// The boss sent `die`.
    Died,
    /// A job left the worker unusable.
    Terminated(TerminateReason),
    /// The transport failed.
    ConnectionLost(ChannelError),
}

/// A connected worker.
pub struct Worker {
    channel: Channel,
    executor: Executor,
    stdio: StdioRedirects,
    log: LogContext,
}

impl Worker {
    pub fn new(channel: Channel, executor: Executor, log: LogContext) -> Self {
        Self {
            channel,
            executor,
            stdio: StdioRedirects::new(),
            log,
        }
    }

    /// Replace the standard-stream redirector.
    pub fn with_stdio(mut self, stdio: StdioRedirects) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Serve messages until `die`, a terminating job or a transport failure.
    pub fn run(&mut self) -> LoopExit {
        tracing::info!("entering control loop");
        loop {
            let message = match self.channel.read() {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "lost connection to boss");
                    return LoopExit::ConnectionLost(e);
                }
            };

            let message = match ControlMessage::try_from(message) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed message");
                    continue;
                }
            };

            if let Some(exit) = self.handle(message) {
                return exit;
            }
        }
    }

    /// Apply one message. Returns `Some` when the loop must end.
    pub fn handle(&mut self, message: ControlMessage) -> Option<LoopExit> {
        tracing::debug!(kind = message.name(), "received message");
        match message {
            ControlMessage::Setup(setup) => self.setup(setup),
            ControlMessage::Stdout(fd) => self.redirect(Stream::Stdout, fd),
            ControlMessage::Stderr(fd) => self.redirect(Stream::Stderr, fd),
            ControlMessage::Logging(fd) => self.log.set_user(File::from(fd)),
            ControlMessage::Pilog(fd) => self.log.set_pilog(File::from(fd)),
            ControlMessage::FaultHandler(fd) => {
                if let Err(e) = CrashReporter::enable(fd) {
                    tracing::warn!(error = %e, "could not enable crash reporting");
                }
            }
            ControlMessage::Info { qdesc } => tracing::info!(?qdesc, "boss info"),
            ControlMessage::Die => {
                tracing::info!("boss asked us to exit");
                if let Err(e) = self.stdio.restore_stderr() {
                    tracing::warn!(error = %e, "could not restore stderr");
                }
                return Some(LoopExit::Died);
            }
            ControlMessage::Assign(assign) => {
                let AssignMessage {
                    assignment,
                    payload,
                } = *assign;
                let disposition = self.executor.execute(&assignment, &payload, &self.channel);
                if let Disposition::Terminate(reason) = disposition {
                    tracing::info!(jid = assignment.jid, %reason, "worker cannot take more jobs");
                    return Some(LoopExit::Terminated(reason));
                }
            }
            ControlMessage::Unknown(kind) => {
                tracing::warn!(kind, "ignoring unknown message type");
            }
        }
        None
    }

    fn setup(&mut self, setup: Setup) {
        self.log.set_diagnostic(File::from(setup.log));
        tracing::info!(hostname = ?setup.hostname, pid = std::process::id(), "diagnostic log attached");
    }

    fn redirect(&mut self, stream: Stream, fd: OwnedFd) {
        if let Err(e) = self.stdio.redirect(stream, fd) {
            tracing::warn!(?stream, error = %e, "could not redirect stream");
        }
    }
}
