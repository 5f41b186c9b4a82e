//! Job executor.
//!
//! Runs one assignment from acceptance to its single `finished` report:
//!
//! 1. **Accepted**: tell the boss the job is being processed.
//! 2. **Contained**: cap the job owner's process count.
//! 3. **Configured**: point the execution context at the job owner.
//! 4. **Decoded**: resolve the callable and decode its arguments, retrying
//!    names that are not registered yet. Failure here ends the worker.
//! 5. **Executing**: run the callable with SIGTERM turned into a flag and
//!    panics caught, optionally profiled, then serialize the result.
//! 6. **Finalizing**: bail out in forked children, restore SIGTERM, close
//!    the context and check for threads the job left behind.
//! 7. **Reported**: flush output, send `profile` if requested, then exactly
//!    one `finished`.
//!
//! The returned [`Disposition`] tells the control loop whether this worker
//! may take another job.

pub mod containment;
pub mod decode;
pub mod outcome;
pub mod panic;
pub mod profile;
pub mod signal;
pub mod threads;

use std::process;
use std::thread;
use std::time::{Duration, Instant};

use employee_channel::{Channel, ChannelResult, Reporter};
use employee_protocol::{Assignment, Report};
use serde_json::Value;

use crate::context::{ExecutionContext, SerializationLevel, RESULT_SIZE_LIMIT};
use crate::log::PILOG_TARGET;
use crate::registry::{FunctionRegistry, JobContext, JobError, JobResult};
use crate::stdio;

pub use decode::{CallableRef, DecodeError, RetryPolicy};
pub use outcome::{Disposition, JobOutcome, OutcomeBody, TerminateReason};
pub use profile::ProfileStats;
pub use threads::{NoCensus, ProcTaskCensus, ThreadCensus, ThreadInfo};

use decode::DecodedJob;
use profile::Profiler;
use signal::TerminationGuard;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Apply the per-class process ceiling to each job.
    pub containment: bool,
    /// Retry policy for unresolved callable names.
    pub retry: RetryPolicy,
    /// How long leftover threads get to finish before they count as leaked.
    pub thread_grace: Duration,
    /// Maximum serialized result size in bytes.
    pub result_limit: usize,
    /// How long a job may keep running after SIGTERM before the worker
    /// reports it killed and exits on its own. `None` waits for the job.
    pub kill_grace: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            containment: true,
            retry: RetryPolicy::default(),
            thread_grace: Duration::from_millis(20),
            result_limit: RESULT_SIZE_LIMIT,
            kill_grace: Some(Duration::from_secs(2)),
        }
    }
}

/// How long the kill watchdog waits for its report to be written.
const KILL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the executor sends its reports.
pub trait Outbox {
    fn deliver(&self, report: Report) -> ChannelResult<()>;

    /// A sender the kill watchdog can use while the job still runs.
    fn reporter(&self) -> Option<Reporter> {
        None
    }
}

impl Outbox for Channel {
    fn deliver(&self, report: Report) -> ChannelResult<()> {
        self.report(report)
    }

    fn reporter(&self) -> Option<Reporter> {
        Some(Channel::reporter(self))
    }
}

/// Runs assignments one at a time.
pub struct Executor {
    config: ExecutorConfig,
    registry: FunctionRegistry,
    context: Box<dyn ExecutionContext>,
    census: Box<dyn ThreadCensus>,
    pid: u32,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        registry: FunctionRegistry,
        context: Box<dyn ExecutionContext>,
    ) -> Self {
        panic::install_hook();
        Self {
            config,
            registry,
            context,
            census: Box::new(ProcTaskCensus),
            pid: process::id(),
        }
    }

    /// Replace the thread census used for leak detection.
    pub fn with_census(mut self, census: Box<dyn ThreadCensus>) -> Self {
        self.census = census;
        self
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one assignment and report its outcome through `outbox`.
    pub fn execute(
        &mut self,
        assignment: &Assignment,
        payload: &[u8],
        outbox: &dyn Outbox,
    ) -> Disposition {
        let jid = assignment.jid;
        tracing::info!(jid, "assigned job");

        if let Err(e) = outbox.deliver(Report::Processing) {
            tracing::warn!(jid, error = %e, "could not send processing message");
            return Disposition::Terminate(TerminateReason::ConnectionLost);
        }

        if self.config.containment {
            if let Err(e) = containment::restrict(&assignment.core_type, assignment.cores) {
                tracing::warn!(jid, error = %e, "could not restrict process count");
            }
        }

        let outcome = self.run(assignment, payload, outbox.reporter());
        self.report(jid, outcome, outbox)
    }

    fn run(&mut self, assignment: &Assignment, payload: &[u8], reporter: Option<Reporter>) -> JobOutcome {
        let jid = assignment.jid;
        tracing::debug!(
            jid,
            payload_length = payload.len(),
            payload_parts = ?assignment.payload_parts,
            "configuring execution context for job owner"
        );

        let credentials = &assignment.credentials;
        if let Err(e) = self
            .context
            .configure(credentials, assignment.ujid, &credentials.server_url)
        {
            tracing::error!(jid, error = %e, "could not configure execution context");
            let mut outcome = JobOutcome::failure(outcome::traceback(jid, &e), Duration::ZERO);
            outcome.mark_fatal(TerminateReason::ContextFailed);
            return outcome;
        }

        let started = Instant::now();
        let job = match self.decode(assignment, payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(target: PILOG_TARGET, "Could not decode job {}: {}", jid, e);
                let mut outcome = JobOutcome::failure(outcome::traceback(jid, &e), started.elapsed());
                outcome.mark_fatal(TerminateReason::DecodeFailed);
                return outcome;
            }
        };

        let baseline = self.census.snapshot();
        let guard = TerminationGuard::install()
            .and_then(|guard| match self.config.kill_grace {
                Some(grace) => guard.with_watchdog(grace, move || kill(jid, started, reporter)),
                None => Ok(guard),
            })
            .map_err(|e| tracing::warn!(jid, error = %e, "could not install SIGTERM handler"))
            .ok();

        tracing::info!(jid, "executing job");
        let (result, profile) = self.call(jid, assignment, job);

        let mut outcome = match result.and_then(|value| self.serialize(&value, assignment.fast_serialization)) {
            Ok(bytes) => {
                tracing::info!(jid, bytes = bytes.len(), "successfully executed job");
                JobOutcome::success(bytes, Duration::ZERO)
            }
            Err(err) => {
                tracing::warn!(jid, error = %err, "executing job hit an error");
                let mut outcome = JobOutcome::failure(outcome::traceback(jid, &err), Duration::ZERO);
                if let Some(reason) = TerminateReason::for_error(&err) {
                    outcome.mark_fatal(reason);
                }
                outcome
            }
        };
        outcome.profile = profile;

        // Finalizing
        if process::id() != self.pid {
            // SAFETY: a forked child must not run the parent's cleanup or
            // reporting; _exit skips both.
            unsafe { libc::_exit(0) };
        }
        drop(guard);

        match self.context.close() {
            Ok(open) => tracing::debug!(jid, open, "closed execution context"),
            Err(e) => tracing::warn!(jid, error = %e, "could not close execution context"),
        }

        if outcome.fatal.is_none() {
            if let Some(leaked) = self.leaked_threads(baseline) {
                let names: Vec<String> = leaked.iter().map(ToString::to_string).collect();
                tracing::info!(jid, threads = ?names, "job threads did not terminate");
                tracing::info!(
                    target: PILOG_TARGET,
                    "Cannot use persistent process due to following thread(s) still running:\n{}\n",
                    names.join("\n")
                );
                outcome.mark_fatal(TerminateReason::LeakedThreads(leaked));
            }
        }

        outcome.runtime = started.elapsed();
        outcome
    }

    fn decode(&self, assignment: &Assignment, payload: &[u8]) -> Result<DecodedJob, DecodeError> {
        let parts = assignment.split_payload(payload)?;
        let kind = assignment.job_kind();
        decode::with_retry(&self.config.retry, || {
            decode::decode_job(&self.registry, kind, parts)
        })
    }

    fn call(
        &mut self,
        jid: u64,
        assignment: &Assignment,
        job: DecodedJob,
    ) -> (JobResult<Value>, Option<ProfileStats>) {
        let job_context = JobContext::new(jid, assignment.ujid);
        let DecodedJob {
            callable,
            args,
            kwargs,
        } = job;
        let context = self.context.as_mut();

        let profiler = assignment.profile.then(Profiler::start);
        let result = panic::catch(|| callable.call(&job_context, context, args, kwargs))
            .unwrap_or_else(|report| Err(JobError::Panicked(report)));
        let profile = profiler.map(Profiler::finish);

        let result = match result {
            _ if signal::termination_requested() => {
                if let Err(e) = &result {
                    tracing::info!(jid, error = %e, "job failed after termination request");
                }
                Err(JobError::Killed)
            }
            other => other,
        };
        (result, profile)
    }

    fn serialize(&self, value: &Value, level: u8) -> JobResult<Vec<u8>> {
        let bytes = self
            .context
            .serialize(value, SerializationLevel::from_wire(level))?;
        self.context.check_size(bytes.len(), self.config.result_limit)?;
        Ok(bytes)
    }

    fn leaked_threads(&self, baseline: Option<Vec<ThreadInfo>>) -> Option<Vec<ThreadInfo>> {
        let baseline = baseline?;
        if threads::new_threads(&baseline, &self.census.snapshot()?).is_empty() {
            return None;
        }
        thread::sleep(self.config.thread_grace);
        let leaked = threads::new_threads(&baseline, &self.census.snapshot()?);
        (!leaked.is_empty()).then_some(leaked)
    }

    fn report(&self, jid: u64, mut outcome: JobOutcome, outbox: &dyn Outbox) -> Disposition {
        stdio::flush_all();

        if matches!(&outcome.body, OutcomeBody::Success(bytes) if bytes.is_empty()) {
            tracing::error!(jid, "critical error: no result and no traceback");
            outcome.body = OutcomeBody::Failure(format!(
                "Job {} produced neither a result nor a traceback\n",
                jid
            ));
        }

        if let Some(stats) = &outcome.profile {
            match stats.to_payload() {
                Ok(stats) => {
                    if let Err(e) = outbox.deliver(Report::Profile { stats }) {
                        tracing::warn!(jid, error = %e, "could not send profile");
                    }
                }
                Err(e) => tracing::warn!(jid, error = %e, "could not encode profile"),
            }
        }

        if let Err(e) = outbox.deliver(outcome.finished_report()) {
            tracing::error!(jid, error = %e, "could not send finished message");
            outcome.mark_fatal(TerminateReason::ConnectionLost);
        }

        let disposition = outcome.disposition();
        tracing::info!(jid, success = outcome.is_success(), ?disposition, "reported job");
        disposition
    }
}

/// Last resort for a job that ignored SIGTERM: report it killed, then exit
/// without unwinding the job's thread.
fn kill(jid: u64, started: Instant, reporter: Option<Reporter>) {
    tracing::error!(jid, "job ignored termination request, exiting");
    if let Some(reporter) = reporter {
        let runtime = started.elapsed().as_secs_f64();
        let report = Report::failure(runtime, outcome::traceback(jid, &JobError::Killed));
        if reporter.report(report).is_ok() && !reporter.flush(KILL_FLUSH_TIMEOUT) {
            tracing::warn!(jid, "kill report not written before exit");
        }
    }
    // SAFETY: the job thread is still running; _exit ends the process
    // without touching state it may hold.
    unsafe { libc::_exit(0) };
}
