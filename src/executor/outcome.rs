//! Job outcomes and what they mean for the worker.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use employee_protocol::Report;

use super::profile::ProfileStats;
use super::threads::ThreadInfo;
use crate::registry::JobError;

/// Maximum length of a reported traceback, in characters.
pub const TRACEBACK_LIMIT: usize = 1_000_000;

/// Why the worker must stop after a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The assignment payload could not be decoded.
    DecodeFailed,
    /// The execution context refused the job owner's configuration.
    ContextFailed,
    /// Job code asked the process to exit.
    Exit,
    OutOfMemory,
    /// SIGTERM arrived while the job ran.
    Killed,
    /// Threads started by the job were still running afterwards.
    LeakedThreads(Vec<ThreadInfo>),
    /// Reports could not be delivered to the boss.
    ConnectionLost,
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeFailed => write!(f, "could not decode assignment"),
            Self::ContextFailed => write!(f, "could not configure execution context"),
            Self::Exit => write!(f, "job requested exit"),
            Self::OutOfMemory => write!(f, "job ran out of memory"),
            Self::Killed => write!(f, "job was killed"),
            Self::LeakedThreads(threads) => {
                write!(f, "job left {} thread(s) running", threads.len())
            }
            Self::ConnectionLost => write!(f, "connection to boss lost"),
        }
    }
}

impl TerminateReason {
    /// The reason a job error ends the worker, if it does.
    pub fn for_error(err: &JobError) -> Option<Self> {
        match err {
            JobError::Exit(_) => Some(Self::Exit),
            JobError::OutOfMemory(_) => Some(Self::OutOfMemory),
            JobError::Killed => Some(Self::Killed),
            _ => None,
        }
    }
}

/// What the control loop does after a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Wait for the next assignment.
    Continue,
    Terminate(TerminateReason),
}

impl Disposition {
    pub fn is_terminate(&self) -> bool {
        matches!(self, Self::Terminate(_))
    }
}

/// The body of a `finished` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeBody {
    /// The serialized result.
    Success(Vec<u8>),
    /// A traceback.
    Failure(String),
}

/// Everything reported about one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub body: OutcomeBody,
    pub runtime: Duration,
    pub profile: Option<ProfileStats>,
    pub fatal: Option<TerminateReason>,
}

impl JobOutcome {
    pub fn success(result: Vec<u8>, runtime: Duration) -> Self {
        Self {
            body: OutcomeBody::Success(result),
            runtime,
            profile: None,
            fatal: None,
        }
    }

    pub fn failure(traceback: String, runtime: Duration) -> Self {
        Self {
            body: OutcomeBody::Failure(traceback),
            runtime,
            profile: None,
            fatal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, OutcomeBody::Success(_))
    }

    /// Mark the worker for termination. The first reason wins.
    pub fn mark_fatal(&mut self, reason: TerminateReason) {
        if self.fatal.is_none() {
            self.fatal = Some(reason);
        }
    }

    pub fn disposition(&self) -> Disposition {
        match &self.fatal {
            Some(reason) => Disposition::Terminate(reason.clone()),
            None => Disposition::Continue,
        }
    }

    /// The `finished` report for this outcome.
    pub fn finished_report(&self) -> Report {
        let runtime = self.runtime.as_secs_f64();
        match &self.body {
            OutcomeBody::Success(result) => Report::success(runtime, result.clone()),
            OutcomeBody::Failure(traceback) => Report::failure(runtime, traceback.clone()),
        }
    }
}

/// Cut `text` to at most `limit` characters.
pub fn truncate_chars(mut text: String, limit: usize) -> String {
    if let Some((index, _)) = text.char_indices().nth(limit) {
        text.truncate(index);
    }
    text
}

/// Render a failure the way the boss shows it to the job owner.
pub fn traceback(jid: u64, err: &(dyn StdError + 'static)) -> String {
    let mut out = format!("Job {} failed:\n{}\n", jid, err);
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\nCaused by:\n    {}\n", cause));
        source = cause.source();
    }
    if let Some(JobError::Panicked(report)) = err.downcast_ref::<JobError>() {
        if let Some(backtrace) = &report.backtrace {
            out.push_str("\nstack backtrace:\n");
            out.push_str(backtrace);
        }
    }
    truncate_chars(out, TRACEBACK_LIMIT)
}
