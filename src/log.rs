//! Logging context.
//!
//! The worker writes three streams, each to a descriptor handed over by the
//! boss:
//!
//! - the diagnostic log (`setup`): events from the worker's own crates
//! - the user log (`logging`): events from every other target, i.e. job code
//! - the pilog (`pilog`): user-visible notices, emitted with target [`PILOG_TARGET`]
//!
//! A [`LogContext`] owns one swappable sink per stream. Until a descriptor
//! arrives, a sink discards what it is given.

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{Level, Metadata};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

/// Target for user-visible worker notices.
pub const PILOG_TARGET: &str = "pilog";

/// Whether an event target belongs to the worker itself.
pub fn is_worker_target(target: &str) -> bool {
    target == "employee" || target.starts_with("employee::") || target.starts_with("employee_")
}

fn is_user_target(target: &str) -> bool {
    target != PILOG_TARGET && !is_worker_target(target)
}

/// A log destination that can be replaced while subscribers hold it.
#[derive(Debug, Clone, Default)]
pub struct SharedSink {
    file: Arc<Mutex<Option<File>>>,
}

impl SharedSink {
    /// Point the sink at a new file. The previous one is closed.
    pub fn replace(&self, file: File) {
        let mut slot = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(file);
    }

    pub fn is_attached(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Writer handed to `fmt` layers for a single event.
pub struct SinkWriter {
    sink: SharedSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self.sink.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = slot.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut slot = self.sink.file.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SharedSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter { sink: self.clone() }
    }
}

/// The worker's three log sinks, built once at bootstrap.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    diagnostic: SharedSink,
    user: SharedSink,
    pilog: SharedSink,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the worker's own log to `file`.
    pub fn set_diagnostic(&self, file: File) {
        self.diagnostic.replace(file);
    }

    /// Route job-code log events to `file`.
    pub fn set_user(&self, file: File) {
        self.user.replace(file);
    }

    /// Route user-visible notices to `file`.
    pub fn set_pilog(&self, file: File) {
        self.pilog.replace(file);
    }

    /// Build a subscriber writing through this context's sinks.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let diagnostic = fmt::layer()
            .with_writer(self.diagnostic.clone())
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(filter_fn(|meta: &Metadata<'_>| {
                is_worker_target(meta.target()) && *meta.level() <= Level::DEBUG
            }));

        let user = fmt::layer()
            .with_writer(self.user.clone())
            .with_ansi(false)
            .with_filter(filter_fn(|meta: &Metadata<'_>| {
                is_user_target(meta.target()) && *meta.level() <= Level::DEBUG
            }));

        let pilog = fmt::layer()
            .with_writer(self.pilog.clone())
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_filter(filter_fn(|meta: &Metadata<'_>| meta.target() == PILOG_TARGET));

        Registry::default().with(diagnostic).with(user).with(pilog)
    }

    /// Make this context the process-wide subscriber.
    pub fn install(&self) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::subscriber::set_global_default(self.subscriber())
    }
}
