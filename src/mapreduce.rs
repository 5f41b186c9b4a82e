//! Map/reduce adapter.
//!
//! A map-phase job runs a mapper over every record of one split of a data
//! source and passes the outputs through a combiner. A reduce-phase job
//! runs a reducer over the concatenated results of upstream jobs. Both
//! materialize their output into one array so it can travel as a single
//! result payload.

use std::io::BufRead;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::{ExecutionContext, SourceView};
use crate::registry::{
    Combiner, FunctionRegistry, JobContext, JobError, JobResult, Mapper, RecordReader,
    RecordStream, Reducer,
};

/// Name of the built-in line reader.
pub const LINES_READER: &str = "lines";
/// Name of the built-in pass-through combiner.
pub const IDENTITY_COMBINER: &str = "identity";

/// Register the built-in reader and combiner.
pub fn register_builtins(registry: &FunctionRegistry) {
    registry.register_reader(LINES_READER, LineRecordReader);
    registry.register_combiner(IDENTITY_COMBINER, |stream| stream);
}

/// Newline-delimited records.
///
/// A split that does not start at offset 0 skips its first line, which
/// belongs to the previous split. A line is read while its first byte is at
/// or before the split's end offset, so the line straddling a boundary is
/// read exactly once. Records are strings without the line terminator; a
/// line that is not valid UTF-8 fails the stream with an `InvalidData` error.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineRecordReader;

impl RecordReader for LineRecordReader {
    fn read(&self, view: SourceView, end_offset: u64) -> RecordStream<'static> {
        let skip_first = view.position() != 0;
        Box::new(Lines {
            view,
            end_offset,
            skip_first,
            done: false,
        })
    }
}

struct Lines {
    view: SourceView,
    end_offset: u64,
    skip_first: bool,
    done: bool,
}

impl Lines {
    fn fail(&mut self, err: std::io::Error) -> Option<JobResult<Value>> {
        self.done = true;
        Some(Err(err.into()))
    }
}

impl Iterator for Lines {
    type Item = JobResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.skip_first {
            self.skip_first = false;
            let mut partial = Vec::new();
            if let Err(e) = self.view.read_until(b'\n', &mut partial) {
                return self.fail(e);
            }
        }

        if self.view.position() > self.end_offset {
            self.done = true;
            return None;
        }

        let offset = self.view.position();
        let mut line = Vec::new();
        match self.view.read_until(b'\n', &mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                match String::from_utf8(line) {
                    Ok(text) => Some(Ok(Value::String(text))),
                    Err(e) => self.fail(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("record at offset {} is not valid UTF-8: {}", offset, e.utf8_error()),
                    )),
                }
            }
            Err(e) => self.fail(e),
        }
    }
}

/// Where a map-phase job reads its records from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    pub name: String,
    pub size: u64,
}

/// A mapper bound to a data source, record reader and combiner.
///
/// Called with positional arguments `[start_offset, end_offset]`.
pub struct MapCombine {
    mapper: Mapper,
    source: SourceBinding,
    reader: Arc<dyn RecordReader>,
    combiner: Combiner,
}

impl MapCombine {
    pub fn new(
        mapper: Mapper,
        source: SourceBinding,
        reader: Arc<dyn RecordReader>,
        combiner: Combiner,
    ) -> Self {
        Self {
            mapper,
            source,
            reader,
            combiner,
        }
    }

    pub fn call(
        &self,
        job: &JobContext,
        context: &mut dyn ExecutionContext,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> JobResult<Value> {
        if !kwargs.is_empty() {
            return Err(JobError::InvalidArguments(
                "map-phase jobs take no keyword arguments".to_string(),
            ));
        }
        let [start, end] = args else {
            return Err(JobError::InvalidArguments(format!(
                "map-phase jobs take [start_offset, end_offset], got {} arguments",
                args.len()
            )));
        };
        let start = start
            .as_u64()
            .ok_or_else(|| JobError::InvalidArguments("start_offset must be an integer".into()))?;
        let end = end
            .as_u64()
            .ok_or_else(|| JobError::InvalidArguments("end_offset must be an integer".into()))?;

        tracing::debug!(source = %self.source.name, start, end, "opening source split");
        let view = context.open_source(&self.source.name, start, self.source.size)?;
        let records = self.reader.read(view, end);

        let mapper = &self.mapper;
        let outputs: RecordStream<'_> = Box::new(records.flat_map(move |record| {
            let items: Vec<JobResult<Value>> = match record.and_then(|r| mapper(job, r)) {
                Ok(Value::Array(items)) => items.into_iter().map(Ok).collect(),
                Ok(other) => vec![Err(JobError::contract(format!(
                    "mapper returned {}, not an array.\n\nPlease make sure that the mapper \
                     returns an array of outputs for every record.",
                    type_name(&other)
                )))],
                Err(e) => vec![Err(e)],
            };
            items
        }));

        let combined = (self.combiner)(outputs);
        // collecting drops the stream, which closes the source view
        let result = combined.collect::<JobResult<Vec<Value>>>()?;
        Ok(Value::Array(result))
    }
}

/// A reducer over upstream job results.
///
/// Called with one positional argument: the array of upstream job ids.
pub struct Reduce {
    reducer: Reducer,
}

impl Reduce {
    pub fn new(reducer: Reducer) -> Self {
        Self { reducer }
    }

    pub fn call(
        &self,
        job: &JobContext,
        context: &mut dyn ExecutionContext,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> JobResult<Value> {
        if !kwargs.is_empty() {
            return Err(JobError::InvalidArguments(
                "reduce-phase jobs take no keyword arguments".to_string(),
            ));
        }
        let jids = upstream_jids(args)?;
        tracing::debug!(upstream = jids.len(), "fetching upstream results");

        let results = context.fetch_results(&jids)?;
        let flattened: RecordStream<'_> = Box::new(results.into_iter().flatten().map(Ok::<Value, JobError>));

        match (self.reducer)(job, flattened)? {
            Value::Array(items) => Ok(Value::Array(items)),
            other => Err(JobError::contract(format!(
                "reducer is not an iterable: it returned {}",
                type_name(&other)
            ))),
        }
    }
}

fn upstream_jids(args: &[Value]) -> JobResult<Vec<u64>> {
    let invalid = || {
        JobError::InvalidArguments(
            "reduce-phase jobs take one argument: an array of job ids".to_string(),
        )
    };
    let [Value::Array(jids)] = args else {
        return Err(invalid());
    };
    jids.iter()
        .map(|jid| jid.as_u64().ok_or_else(invalid))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextError, ContextResult, SerializationLevel};
    use employee_protocol::Credentials;
    use serde_json::json;

    /// A context serving one in-memory source and fixed upstream results.
    #[derive(Default)]
    struct MemoryContext {
        source: Vec<u8>,
        results: Vec<(u64, Vec<Value>)>,
        opened: Vec<(String, u64)>,
    }

    impl ExecutionContext for MemoryContext {
        fn configure(&mut self, _: &Credentials, _: Option<u64>, _: &str) -> ContextResult<()> {
            Ok(())
        }

        fn serialize(&self, value: &Value, _: SerializationLevel) -> ContextResult<Vec<u8>> {
            serde_json::to_vec(value).map_err(|e| ContextError::Serialization(e.to_string()))
        }

        fn fetch_results(&mut self, jids: &[u64]) -> ContextResult<Vec<Vec<Value>>> {
            jids.iter()
                .map(|jid| {
                    self.results
                        .iter()
                        .find(|(id, _)| id == jid)
                        .map(|(_, values)| values.clone())
                        .ok_or(ContextError::ResultsUnavailable {
                            jid: *jid,
                            reason: "unknown".into(),
                        })
                })
                .collect()
        }

        fn open_source(&mut self, name: &str, start: u64, expected: u64) -> ContextResult<SourceView> {
            if expected != self.source.len() as u64 {
                return Err(ContextError::SizeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: self.source.len() as u64,
                });
            }
            self.opened.push((name.to_string(), start));
            Ok(SourceView::from_bytes(self.source.clone(), start))
        }

        fn close(&mut self) -> ContextResult<bool> {
            Ok(!self.opened.is_empty())
        }
    }

    fn lines(content: &str, start: u64, end: u64) -> Vec<String> {
        LineRecordReader
            .read(SourceView::from_bytes(content.as_bytes().to_vec(), start), end)
            .map(|r| r.unwrap().as_str().unwrap().to_string())
            .collect()
    }

    fn builtins() -> FunctionRegistry {
        let registry = FunctionRegistry::new();
        register_builtins(&registry);
        registry
    }

    fn map_combine(registry: &FunctionRegistry, mapper: &str, size: u64) -> MapCombine {
        MapCombine::new(
            registry.mapper(mapper).unwrap(),
            SourceBinding {
                name: "input.txt".into(),
                size,
            },
            registry.reader(LINES_READER).unwrap(),
            registry.combiner(IDENTITY_COMBINER).unwrap(),
        )
    }

    #[test]
    fn test_lines_whole_file() {
        assert_eq!(lines("a\nbb\nccc\n", 0, 9), vec!["a", "bb", "ccc"]);
        assert_eq!(lines("a\r\nb", 0, 4), vec!["a", "b"]);
    }

    #[test]
    fn test_lines_invalid_utf8_fails_record() {
        let content = b"ok\n\xff\xfe bad\nlater\n".to_vec();
        let mut records = LineRecordReader.read(SourceView::from_bytes(content, 0), 20);

        assert_eq!(records.next().unwrap().unwrap(), Value::String("ok".into()));
        match records.next() {
            Some(Err(JobError::Io(e))) => {
                assert_eq!(e.kind(), std::io::ErrorKind::InvalidData);
                assert!(e.to_string().contains("offset 3"), "{}", e);
            }
            other => panic!("expected InvalidData, got {:?}", other),
        }
        assert!(records.next().is_none());
    }

    #[test]
    fn test_lines_splits_cover_each_line_once() {
        let content = "a\nbb\nccc\n";
        let first = lines(content, 0, 4);
        let second = lines(content, 4, 9);
        assert_eq!(first, vec!["a", "bb"]);
        assert_eq!(second, vec!["ccc"]);

        // a boundary exactly on a line start goes to the earlier split
        assert_eq!(lines(content, 0, 2), vec!["a", "bb"]);
        assert_eq!(lines(content, 2, 9), vec!["ccc"]);
    }

    #[test]
    fn test_map_five_records_two_outputs_each() {
        let registry = builtins();
        registry.register_mapper("twice", |_job, record| {
            let text = record.as_str().unwrap_or_default().to_string();
            Ok(json!([format!("{}-1", text), format!("{}-2", text)]))
        });

        let content = "r0\nr1\nr2\nr3\nr4\n";
        let mut context = MemoryContext {
            source: content.as_bytes().to_vec(),
            ..Default::default()
        };
        let map = map_combine(&registry, "twice", content.len() as u64);

        let result = map
            .call(
                &JobContext::new(1, None),
                &mut context,
                &[json!(0), json!(content.len())],
                &Map::new(),
            )
            .unwrap();

        let items = result.as_array().unwrap();
        assert_eq!(items.len(), 10);
        let expected: Vec<Value> = (0..5)
            .flat_map(|i| [json!(format!("r{}-1", i)), json!(format!("r{}-2", i))])
            .collect();
        assert_eq!(items, &expected);
        assert_eq!(context.opened, vec![("input.txt".to_string(), 0)]);
    }

    #[test]
    fn test_map_offsets_must_be_integers() {
        let registry = builtins();
        registry.register_mapper("id", |_job, record| Ok(json!([record])));
        let mut context = MemoryContext::default();
        let map = map_combine(&registry, "id", 0);

        let err = map
            .call(&JobContext::new(1, None), &mut context, &[json!("0"), json!(5)], &Map::new())
            .unwrap_err();
        assert!(err.to_string().contains("start_offset must be an integer"));
        assert!(context.opened.is_empty());
    }

    #[test]
    fn test_mapper_must_return_array() {
        let registry = builtins();
        registry.register_mapper("scalar", |_job, _record| Ok(json!(1)));
        let mut context = MemoryContext {
            source: b"x\n".to_vec(),
            ..Default::default()
        };
        let map = map_combine(&registry, "scalar", 2);

        let err = map
            .call(&JobContext::new(1, None), &mut context, &[json!(0), json!(2)], &Map::new())
            .unwrap_err();
        assert!(matches!(err, JobError::Contract(_)));
    }

    #[test]
    fn test_combiner_sees_mapper_outputs_in_order() {
        let registry = builtins();
        registry.register_mapper("chars", |_job, record| {
            let chars: Vec<Value> = record
                .as_str()
                .unwrap_or_default()
                .chars()
                .map(|c| json!(c.to_string()))
                .collect();
            Ok(Value::Array(chars))
        });
        registry.register_combiner("dedupe", |stream| {
            let mut last: Option<Value> = None;
            Box::new(stream.filter(move |item| match item {
                Ok(value) if last.as_ref() == Some(value) => false,
                Ok(value) => {
                    last = Some(value.clone());
                    true
                }
                Err(_) => true,
            }))
        });

        let content = "aab\nbc\n";
        let mut context = MemoryContext {
            source: content.as_bytes().to_vec(),
            ..Default::default()
        };
        let map = MapCombine::new(
            registry.mapper("chars").unwrap(),
            SourceBinding {
                name: "input.txt".into(),
                size: content.len() as u64,
            },
            Arc::new(LineRecordReader),
            registry.combiner("dedupe").unwrap(),
        );

        let result = map
            .call(&JobContext::new(1, None), &mut context, &[json!(0), json!(7)], &Map::new())
            .unwrap();
        assert_eq!(result, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_reduce_flattens_upstream_in_order() {
        let registry = FunctionRegistry::new();
        registry.register_reducer("collect", |_job, stream| {
            stream.collect::<JobResult<Vec<Value>>>().map(Value::Array)
        });
        let mut context = MemoryContext {
            results: vec![(1, vec![json!("a"), json!("b")]), (2, vec![json!("c")])],
            ..Default::default()
        };
        let reduce = Reduce::new(registry.reducer("collect").unwrap());

        let result = reduce
            .call(&JobContext::new(3, None), &mut context, &[json!([2, 1])], &Map::new())
            .unwrap();
        assert_eq!(result, json!(["c", "a", "b"]));
    }

    #[test]
    fn test_reducer_must_return_array() {
        let registry = FunctionRegistry::new();
        registry.register_reducer("count", |_job, stream| Ok(json!(stream.count())));
        let mut context = MemoryContext {
            results: vec![(1, vec![json!(1)])],
            ..Default::default()
        };
        let reduce = Reduce::new(registry.reducer("count").unwrap());

        let err = reduce
            .call(&JobContext::new(3, None), &mut context, &[json!([1])], &Map::new())
            .unwrap_err();
        assert!(err.to_string().starts_with("reducer is not an iterable"));
    }

    #[test]
    fn test_reduce_args_must_be_job_ids() {
        let registry = FunctionRegistry::new();
        registry.register_reducer("empty", |_job, _stream| Ok(json!([])));
        let reduce = Reduce::new(registry.reducer("empty").unwrap());
        let mut context = MemoryContext::default();
        for args in [vec![], vec![json!(1)], vec![json!(["x"])]] {
            assert!(matches!(
                reduce.call(&JobContext::new(3, None), &mut context, &args, &Map::new()),
                Err(JobError::InvalidArguments(_))
            ));
        }
    }
}
