//! Assignment payload decoding.
//!
//! The callable range decodes to a [`CallableRef`], which is resolved
//! against the [`FunctionRegistry`]. The argument ranges decode to a JSON
//! array and a JSON object; an empty range means no arguments.
//!
//! Code distribution can lag behind assignment, so a name that is not
//! registered yet is retried for a while before the job fails.

use std::thread;
use std::time::{Duration, Instant};

use employee_protocol::{JobKind, PayloadParts, ProtocolError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::mapreduce::{MapCombine, Reduce, SourceBinding, IDENTITY_COMBINER, LINES_READER};
use crate::registry::{Function, FunctionRegistry, JobContext, JobResult};

/// Errors from decoding an assignment payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A name that may still be registered later.
    #[error("{kind} {name:?} is not registered")]
    Unresolved { kind: &'static str, name: String },

    #[error("could not decode callable: {0}")]
    Callable(#[source] serde_json::Error),

    #[error("could not decode positional arguments: {0}")]
    Arguments(#[source] serde_json::Error),

    #[error("could not decode keyword arguments: {0}")]
    KeywordArguments(#[source] serde_json::Error),

    #[error("map-phase callable {0:?} names no data source")]
    MissingSource(String),

    #[error(transparent)]
    Payload(#[from] ProtocolError),
}

impl DecodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
    }
}

/// The decoded form of an assignment's callable range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallableRef {
    pub name: String,
    /// Data source of a map-phase job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Expected size in bytes of `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    #[serde(default = "default_reader")]
    pub reader: String,
    #[serde(default = "default_combiner")]
    pub combiner: String,
}

fn default_reader() -> String {
    LINES_READER.to_string()
}

fn default_combiner() -> String {
    IDENTITY_COMBINER.to_string()
}

impl CallableRef {
    /// A plain function or reducer.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            source_size: None,
            reader: default_reader(),
            combiner: default_combiner(),
        }
    }

    /// A mapper over `source`.
    pub fn mapper(name: impl Into<String>, source: impl Into<String>, size: u64) -> Self {
        Self {
            source: Some(source.into()),
            source_size: Some(size),
            ..Self::named(name)
        }
    }
}

/// A resolved callable, ready to run.
pub enum Callable {
    Function(Function),
    Map(MapCombine),
    Reduce(Reduce),
}

impl Callable {
    pub fn call(
        &self,
        job: &JobContext,
        context: &mut dyn ExecutionContext,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> JobResult<Value> {
        match self {
            Self::Function(function) => function(job, args, kwargs),
            Self::Map(map) => map.call(job, context, &args, &kwargs),
            Self::Reduce(reduce) => reduce.call(job, context, &args, &kwargs),
        }
    }
}

/// A fully decoded assignment.
pub struct DecodedJob {
    pub callable: Callable,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

fn unresolved(kind: &'static str, name: &str) -> DecodeError {
    DecodeError::Unresolved {
        kind,
        name: name.to_string(),
    }
}

/// Resolve a callable reference for a job of the given kind.
pub fn resolve(
    registry: &FunctionRegistry,
    kind: JobKind,
    reference: &CallableRef,
) -> Result<Callable, DecodeError> {
    let name = reference.name.as_str();
    match kind {
        JobKind::Plain => registry
            .function(name)
            .map(Callable::Function)
            .ok_or_else(|| unresolved("function", name)),
        JobKind::Reduce => registry
            .reducer(name)
            .map(|reducer| Callable::Reduce(Reduce::new(reducer)))
            .ok_or_else(|| unresolved("reducer", name)),
        JobKind::Map => {
            let (Some(source), Some(size)) = (&reference.source, reference.source_size) else {
                return Err(DecodeError::MissingSource(name.to_string()));
            };
            let mapper = registry.mapper(name).ok_or_else(|| unresolved("mapper", name))?;
            let reader = registry
                .reader(&reference.reader)
                .ok_or_else(|| unresolved("record reader", &reference.reader))?;
            let combiner = registry
                .combiner(&reference.combiner)
                .ok_or_else(|| unresolved("combiner", &reference.combiner))?;
            Ok(Callable::Map(MapCombine::new(
                mapper,
                SourceBinding {
                    name: source.clone(),
                    size,
                },
                reader,
                combiner,
            )))
        }
    }
}

/// Decode all three payload ranges.
pub fn decode_job(
    registry: &FunctionRegistry,
    kind: JobKind,
    parts: PayloadParts<'_>,
) -> Result<DecodedJob, DecodeError> {
    let reference: CallableRef =
        serde_json::from_slice(parts.callable).map_err(DecodeError::Callable)?;
    let callable = resolve(registry, kind, &reference)?;

    let args = if parts.args.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(parts.args).map_err(DecodeError::Arguments)?
    };
    let kwargs = if parts.kwargs.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(parts.kwargs).map_err(DecodeError::KeywordArguments)?
    };

    Ok(DecodedJob {
        callable,
        args,
        kwargs,
    })
}

/// How long to keep retrying unresolved names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Measured from the first failure.
    pub deadline: Duration,
    /// Each wait is uniformly random in `[0, max_backoff)`.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(2),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> Duration {
        if self.max_backoff.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..self.max_backoff)
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// keeps failing past the policy's deadline.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    mut attempt: impl FnMut() -> Result<T, DecodeError>,
) -> Result<T, DecodeError> {
    let mut deadline: Option<Instant> = None;
    loop {
        match attempt() {
            Err(e) if e.is_retryable() => {
                let now = Instant::now();
                let limit = *deadline.get_or_insert(now + policy.deadline);
                if now > limit {
                    return Err(e);
                }
                tracing::info!(error = %e, "could not decode, retrying");
                thread::sleep(policy.backoff());
            }
            other => return other,
        }
    }
}
