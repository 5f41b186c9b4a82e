//! Functions the `employee` binary registers out of the box.
//!
//! Small, dependency-free jobs that are handy for smoke-testing a boss:
//!
//! | name | kind | behavior |
//! |---|---|---|
//! | `echo` | function | returns its positional arguments |
//! | `sleep` | function | sleeps `args[0]` seconds, honoring termination |
//! | `burn` | function | keeps a core busy for `args[0]` seconds, never checking in |
//! | `fail` | function | fails with `args[0]` as the message |
//! | `exit` | function | asks the worker to exit after reporting |
//! | `words` | mapper | splits a record into words |
//! | `word_count` | reducer | counts words, as `[[word, count], ...]` sorted by word |
//! | `sum` | reducer | adds up numbers, as `[total]` |

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::registry::{FunctionRegistry, JobContext, JobError, JobResult, RecordStream};

const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Register every built-in.
pub fn register(registry: &FunctionRegistry) {
    registry.register_function("echo", |_job, args, _kwargs| Ok(Value::Array(args)));
    registry.register_function("sleep", |job, args, _kwargs| {
        let seconds = args.first().and_then(Value::as_f64).unwrap_or(0.0);
        sleep(job, seconds)
    });
    registry.register_function("burn", |_job, args, _kwargs| {
        let seconds = args.first().and_then(Value::as_f64).unwrap_or(0.0);
        burn(seconds)
    });
    registry.register_function("fail", |_job, args, _kwargs| {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        Err(JobError::failed(message))
    });
    registry.register_function("exit", |job, _args, _kwargs| {
        Err(JobError::Exit(format!("job {} requested exit", job.jid())))
    });
    registry.register_mapper("words", |_job, record| Ok(words(&record)));
    registry.register_reducer("word_count", |job, stream| word_count(job, stream));
    registry.register_reducer("sum", |_job, stream| sum(stream));
}

fn sleep(job: &JobContext, seconds: f64) -> JobResult<Value> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(JobError::InvalidArguments(format!(
            "sleep needs a non-negative number of seconds, got {}",
            seconds
        )));
    }
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    loop {
        job.checkpoint()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(json!(seconds));
        }
        thread::sleep(SLEEP_STEP.min(deadline - now));
    }
}

fn burn(seconds: f64) -> JobResult<Value> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(JobError::InvalidArguments(format!(
            "burn needs a non-negative number of seconds, got {}",
            seconds
        )));
    }
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let mut rounds: u64 = 0;
    let mut acc: u64 = 1;
    while Instant::now() < deadline {
        for i in 0..10_000u64 {
            acc = std::hint::black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(i));
        }
        rounds += 1;
    }
    Ok(json!(rounds))
}

fn words(record: &Value) -> Value {
    let text = record.as_str().unwrap_or_default();
    Value::Array(text.split_whitespace().map(|w| json!(w)).collect())
}

fn word_count(job: &JobContext, stream: RecordStream<'_>) -> JobResult<Value> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for item in stream {
        job.checkpoint()?;
        match item? {
            Value::String(word) => *counts.entry(word).or_default() += 1,
            other => {
                return Err(JobError::InvalidArguments(format!(
                    "word_count expects strings, got {}",
                    other
                )));
            }
        }
    }
    Ok(Value::Array(
        counts.into_iter().map(|(word, n)| json!([word, n])).collect(),
    ))
}

fn sum(stream: RecordStream<'_>) -> JobResult<Value> {
    let mut total = 0.0;
    for item in stream {
        let item = item?;
        total += item.as_f64().ok_or_else(|| {
            JobError::InvalidArguments(format!("sum expects numbers, got {}", item))
        })?;
    }
    Ok(json!([total]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn stream(items: Vec<Value>) -> RecordStream<'static> {
        Box::new(items.into_iter().map(Ok))
    }

    fn job() -> JobContext {
        JobContext::new(1, None)
    }

    #[test]
    fn test_registers_everything() {
        let registry = FunctionRegistry::new();
        register(&registry);
        for name in ["echo", "sleep", "burn", "fail", "exit"] {
            assert!(registry.function(name).is_some(), "{}", name);
        }
        assert!(registry.mapper("words").is_some());
        assert!(registry.reducer("word_count").is_some());
        assert!(registry.reducer("sum").is_some());
    }

    #[test]
    fn test_fail_uses_message() {
        let registry = FunctionRegistry::new();
        register(&registry);
        let fail = registry.function("fail").unwrap();
        let err = fail(&job(), vec![json!("bad input")], Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        assert!(!err.is_fatal());

        let exit = registry.function("exit").unwrap();
        assert!(exit(&job(), Vec::new(), Map::new()).unwrap_err().is_fatal());
    }

    #[test]
    fn test_sleep_rejects_negative() {
        assert!(matches!(sleep(&job(), -1.0), Err(JobError::InvalidArguments(_))));
        assert_eq!(sleep(&job(), 0.01).unwrap(), json!(0.01));
    }

    #[test]
    fn test_burn_runs_for_requested_time() {
        let started = Instant::now();
        assert!(burn(0.05).unwrap().as_u64().unwrap() > 0);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(burn(f64::NAN), Err(JobError::InvalidArguments(_))));
    }

    #[test]
    fn test_words() {
        assert_eq!(words(&json!("  the cat  sat ")), json!(["the", "cat", "sat"]));
        assert_eq!(words(&json!(3)), json!([]));
    }

    #[test]
    fn test_word_count_sorted() {
        let counted = word_count(&job(), stream(vec![json!("b"), json!("a"), json!("b")])).unwrap();
        assert_eq!(counted, json!([["a", 1], ["b", 2]]));
        assert!(word_count(&job(), stream(vec![json!(1)])).is_err());
    }

    #[test]
    fn test_sum() {
        assert_eq!(sum(stream(vec![json!(1), json!(2.5)])).unwrap(), json!([3.5]));
        assert!(sum(stream(vec![json!("x")])).is_err());
    }
}
