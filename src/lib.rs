//! Employee - per-job worker process
//!
//! An employee connects to its host's boss over a Unix-domain socket,
//! receives job assignments, runs them and reports a serialized result or
//! a traceback for each. Callables are looked up by name in a
//! [`FunctionRegistry`] filled by the embedding program.

pub mod bootstrap;
pub mod builtins;
pub mod config;
pub mod context;
pub mod control;
pub mod crash;
pub mod executor;
pub mod fork_guard;
pub mod log;
pub mod mapreduce;
pub mod registry;
pub mod stdio;

pub use config::{ConfigError, WorkerConfig};
pub use context::{ExecutionContext, StandaloneContext};
pub use control::{LoopExit, Worker};
pub use executor::{Disposition, Executor, ExecutorConfig, TerminateReason};
pub use log::LogContext;
pub use registry::{FunctionRegistry, JobContext, JobError, JobResult};
