//! Function registry.
//!
//! An assignment names its callable; the name is looked up here. The
//! embedding program registers plain functions, map-phase mappers,
//! reduce-phase reducers, record readers and combiners. Registration may
//! continue while the worker runs, so a name that is unknown now may
//! resolve a moment later.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::{ContextError, SourceView};
use crate::executor::panic::PanicReport;
use crate::executor::signal;

/// Errors raised by job code.
#[derive(Debug, Error)]
pub enum JobError {
    /// An ordinary failure; the worker stays reusable.
    #[error("{0}")]
    Failed(String),

    /// The job asked for the worker process to end.
    #[error("exit requested: {0}")]
    Exit(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The worker received a termination request while the job ran.
    #[error("Killed")]
    Killed,

    /// A user-supplied piece broke the map/reduce contract.
    #[error("{0}")]
    Contract(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Panicked(PanicReport),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into())
    }

    /// Whether the worker must end after this failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exit(_) | Self::OutOfMemory(_) | Self::Killed)
    }
}

/// Result type for job code.
pub type JobResult<T> = Result<T, JobError>;

/// A lazy sequence of records or outputs.
pub type RecordStream<'a> = Box<dyn Iterator<Item = JobResult<Value>> + 'a>;

/// What a running job may know about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    jid: u64,
    parent_jid: Option<u64>,
}

impl JobContext {
    pub fn new(jid: u64, parent_jid: Option<u64>) -> Self {
        Self { jid, parent_jid }
    }

    pub fn jid(&self) -> u64 {
        self.jid
    }

    pub fn parent_jid(&self) -> Option<u64> {
        self.parent_jid
    }

    /// Fail with [`JobError::Killed`] once the worker has been asked to terminate.
    ///
    /// Long-running jobs call this between units of work.
    pub fn checkpoint(&self) -> JobResult<()> {
        if signal::termination_requested() {
            return Err(JobError::Killed);
        }
        Ok(())
    }
}

pub type Function =
    Arc<dyn Fn(&JobContext, Vec<Value>, Map<String, Value>) -> JobResult<Value> + Send + Sync>;

/// Maps one record to an array of outputs.
pub type Mapper = Arc<dyn Fn(&JobContext, Value) -> JobResult<Value> + Send + Sync>;

/// Consumes all upstream outputs; must return an array.
pub type Reducer =
    Arc<dyn for<'a> Fn(&JobContext, RecordStream<'a>) -> JobResult<Value> + Send + Sync>;

/// Transforms the mapper output stream lazily.
pub type Combiner = Arc<dyn for<'a> Fn(RecordStream<'a>) -> RecordStream<'a> + Send + Sync>;

/// Splits a data source into records.
pub trait RecordReader: Send + Sync {
    /// Records starting at or before `end_offset`. The stream owns `view`
    /// and closes it when dropped.
    fn read(&self, view: SourceView, end_offset: u64) -> RecordStream<'static>;
}

#[derive(Default)]
struct Tables {
    functions: HashMap<String, Function>,
    mappers: HashMap<String, Mapper>,
    reducers: HashMap<String, Reducer>,
    readers: HashMap<String, Arc<dyn RecordReader>>,
    combiners: HashMap<String, Combiner>,
}

/// Process-wide name → callable tables. Clones share the same tables.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    tables: Arc<RwLock<Tables>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("FunctionRegistry")
            .field("functions", &tables.functions.len())
            .field("mappers", &tables.mappers.len())
            .field("reducers", &tables.reducers.len())
            .field("readers", &tables.readers.len())
            .field("combiners", &tables.combiners.len())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut tables)
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    pub fn register_function<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&JobContext, Vec<Value>, Map<String, Value>) -> JobResult<Value>
            + Send
            + Sync
            + 'static,
    {
        let function: Function = Arc::new(function);
        self.write(|t| t.functions.insert(name.into(), function));
    }

    pub fn register_mapper<F>(&self, name: impl Into<String>, mapper: F)
    where
        F: Fn(&JobContext, Value) -> JobResult<Value> + Send + Sync + 'static,
    {
        let mapper: Mapper = Arc::new(mapper);
        self.write(|t| t.mappers.insert(name.into(), mapper));
    }

    pub fn register_reducer<F>(&self, name: impl Into<String>, reducer: F)
    where
        F: for<'a> Fn(&JobContext, RecordStream<'a>) -> JobResult<Value> + Send + Sync + 'static,
    {
        let reducer: Reducer = Arc::new(reducer);
        self.write(|t| t.reducers.insert(name.into(), reducer));
    }

    pub fn register_reader<R>(&self, name: impl Into<String>, reader: R)
    where
        R: RecordReader + 'static,
    {
        let reader: Arc<dyn RecordReader> = Arc::new(reader);
        self.write(|t| t.readers.insert(name.into(), reader));
    }

    pub fn register_combiner<F>(&self, name: impl Into<String>, combiner: F)
    where
        F: for<'a> Fn(RecordStream<'a>) -> RecordStream<'a> + Send + Sync + 'static,
    {
        let combiner: Combiner = Arc::new(combiner);
        self.write(|t| t.combiners.insert(name.into(), combiner));
    }

    pub fn function(&self, name: &str) -> Option<Function> {
        self.read(|t| t.functions.get(name).cloned())
    }

    pub fn mapper(&self, name: &str) -> Option<Mapper> {
        self.read(|t| t.mappers.get(name).cloned())
    }

    pub fn reducer(&self, name: &str) -> Option<Reducer> {
        self.read(|t| t.reducers.get(name).cloned())
    }

    pub fn reader(&self, name: &str) -> Option<Arc<dyn RecordReader>> {
        self.read(|t| t.readers.get(name).cloned())
    }

    pub fn combiner(&self, name: &str) -> Option<Combiner> {
        self.read(|t| t.combiners.get(name).cloned())
    }
}
