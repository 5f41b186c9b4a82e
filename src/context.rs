//! Execution-context collaborator.
//!
//! The execution context is the job's view of the cluster: it carries the
//! job owner's credentials, serializes results, fetches upstream results
//! for reduce-phase jobs and opens data sources for map-phase jobs.
//! [`StandaloneContext`] is a local implementation backed by directories.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use employee_protocol::Credentials;
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a serialized job result.
pub const RESULT_SIZE_LIMIT: usize = 128_000_000;

/// Errors from the execution context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("execution context is not configured")]
    NotConfigured,

    #[error("invalid configuration: {0}")]
    Configure(String),

    #[error("could not serialize result: {0}")]
    Serialization(String),

    #[error("serialized result is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("results of job {jid} are not available: {reason}")]
    ResultsUnavailable { jid: u64, reason: String },

    #[error("data source {name:?} not found")]
    SourceNotFound { name: String },

    #[error("data source {name:?} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for execution-context operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Result serialization mode, selected per job by `fast_serialization`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationLevel {
    /// Serialize, then decode again to prove the bytes are readable.
    Verified,
    Standard,
    /// Skip any checks the backend can skip.
    Fast,
}

impl SerializationLevel {
    pub fn from_wire(level: u8) -> Self {
        match level {
            0 => Self::Verified,
            1 => Self::Standard,
            _ => Self::Fast,
        }
    }
}

/// The collaborator a job runs against.
pub trait ExecutionContext {
    /// Act on behalf of the job owner.
    fn configure(
        &mut self,
        credentials: &Credentials,
        parent_jid: Option<u64>,
        server_url: &str,
    ) -> ContextResult<()>;

    fn serialize(&self, value: &Value, level: SerializationLevel) -> ContextResult<Vec<u8>>;

    /// Reject a serialized result larger than `limit` bytes.
    fn check_size(&self, size: usize, limit: usize) -> ContextResult<()> {
        if size > limit {
            return Err(ContextError::TooLarge { size, limit });
        }
        Ok(())
    }

    /// Results of upstream jobs, in the order of `jids`.
    fn fetch_results(&mut self, jids: &[u64]) -> ContextResult<Vec<Vec<Value>>>;

    /// Open `name` for reading from byte `start`. The source must be exactly
    /// `expected_size` bytes long.
    fn open_source(&mut self, name: &str, start: u64, expected_size: u64)
        -> ContextResult<SourceView>;

    /// Release per-job resources. Returns whether there was anything to release.
    fn close(&mut self) -> ContextResult<bool>;
}

/// A data source opened at an offset.
///
/// Tracks the absolute offset of the next unread byte so record readers
/// can honour split boundaries.
pub struct SourceView {
    inner: Box<dyn BufRead + Send>,
    position: u64,
}

impl SourceView {
    pub fn new(inner: Box<dyn BufRead + Send>, start: u64) -> Self {
        Self {
            inner,
            position: start,
        }
    }

    /// A view over in-memory bytes, positioned at `start`.
    pub fn from_bytes(bytes: Vec<u8>, start: u64) -> Self {
        let offset = usize::try_from(start).unwrap_or(usize::MAX).min(bytes.len());
        let mut cursor = io::Cursor::new(bytes);
        cursor.set_position(offset as u64);
        Self::new(Box::new(cursor), start)
    }

    /// Absolute offset of the next byte.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl std::fmt::Debug for SourceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceView")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl Read for SourceView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl BufRead for SourceView {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.position += amt as u64;
    }
}

/// Who a configured context acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub api_key: String,
    pub parent_jid: Option<u64>,
    pub server_url: String,
}

/// Execution context backed by local directories.
///
/// Data sources are files under `files_root`; upstream results are JSON
/// arrays stored as `<results_dir>/<jid>.json`.
#[derive(Debug, Default)]
pub struct StandaloneContext {
    files_root: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    principal: Option<Principal>,
    open_sources: usize,
}

impl StandaloneContext {
    pub fn new(files_root: Option<PathBuf>, results_dir: Option<PathBuf>) -> Self {
        Self {
            files_root,
            results_dir,
            principal: None,
            open_sources: 0,
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    fn require_configured(&self) -> ContextResult<()> {
        match self.principal {
            Some(_) => Ok(()),
            None => Err(ContextError::NotConfigured),
        }
    }

    fn source_path(&self, name: &str) -> ContextResult<PathBuf> {
        let root = self.files_root.as_deref().ok_or_else(|| ContextError::SourceNotFound {
            name: name.to_string(),
        })?;
        let relative = Path::new(name);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || !contained {
            return Err(ContextError::SourceNotFound {
                name: name.to_string(),
            });
        }
        Ok(root.join(relative))
    }
}

impl ExecutionContext for StandaloneContext {
    fn configure(
        &mut self,
        credentials: &Credentials,
        parent_jid: Option<u64>,
        server_url: &str,
    ) -> ContextResult<()> {
        if credentials.api_key.is_empty() {
            return Err(ContextError::Configure("api_key is empty".to_string()));
        }
        tracing::debug!(api_key = %credentials.api_key, ?parent_jid, server_url, "configured execution context");
        self.principal = Some(Principal {
            api_key: credentials.api_key.clone(),
            parent_jid,
            server_url: server_url.to_string(),
        });
        Ok(())
    }

    fn serialize(&self, value: &Value, level: SerializationLevel) -> ContextResult<Vec<u8>> {
        let bytes = serde_json::to_vec(value).map_err(|e| ContextError::Serialization(e.to_string()))?;
        if level == SerializationLevel::Verified {
            let decoded: Value = serde_json::from_slice(&bytes)
                .map_err(|e| ContextError::Serialization(format!("verification failed: {}", e)))?;
            if &decoded != value {
                return Err(ContextError::Serialization(
                    "verification failed: decoded value differs".to_string(),
                ));
            }
        }
        Ok(bytes)
    }

    fn fetch_results(&mut self, jids: &[u64]) -> ContextResult<Vec<Vec<Value>>> {
        self.require_configured()?;
        let dir = self.results_dir.clone();
        jids.iter()
            .map(|&jid| {
                let dir = dir.as_deref().ok_or_else(|| ContextError::ResultsUnavailable {
                    jid,
                    reason: "no results directory".to_string(),
                })?;
                let path = dir.join(format!("{}.json", jid));
                let bytes = std::fs::read(&path).map_err(|e| ContextError::ResultsUnavailable {
                    jid,
                    reason: format!("{}: {}", path.display(), e),
                })?;
                serde_json::from_slice::<Vec<Value>>(&bytes).map_err(|e| {
                    ContextError::ResultsUnavailable {
                        jid,
                        reason: format!("not a JSON array: {}", e),
                    }
                })
            })
            .collect()
    }

    fn open_source(
        &mut self,
        name: &str,
        start: u64,
        expected_size: u64,
    ) -> ContextResult<SourceView> {
        self.require_configured()?;
        let path = self.source_path(name)?;
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ContextError::SourceNotFound {
                name: name.to_string(),
            },
            _ => ContextError::Io(e),
        })?;

        let actual = file.metadata()?.len();
        if actual != expected_size {
            return Err(ContextError::SizeMismatch {
                name: name.to_string(),
                expected: expected_size,
                actual,
            });
        }

        file.seek(SeekFrom::Start(start))?;
        self.open_sources += 1;
        Ok(SourceView::new(Box::new(BufReader::new(file)), start))
    }

    fn close(&mut self) -> ContextResult<bool> {
        let was_open = self.open_sources > 0;
        self.open_sources = 0;
        self.principal = None;
        Ok(was_open)
    }
}
