//! SIGTERM during a job.
//!
//! Kept in its own test binary: the termination flag is process-wide, and
//! the in-process tests below take turns through a lock.

use std::fs;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use employee::config::{env, socket_path};
use employee::executor::{CallableRef, NoCensus, Outbox};
use employee::{
    Disposition, Executor, ExecutorConfig, FunctionRegistry, JobError, LogContext, LoopExit,
    StandaloneContext, TerminateReason, Worker,
};
use employee_channel::{Channel, ChannelResult};
use employee_protocol::{names, Assignment, Credentials, JobKind, Meta, Report};
use nix::sys::signal::{kill, raise, Signal};
use nix::unistd::Pid;
use serde_json::json;

static SIGNALS: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    SIGNALS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn executor(registry: FunctionRegistry) -> Executor {
    Executor::new(
        ExecutorConfig {
            containment: false,
            ..ExecutorConfig::default()
        },
        registry,
        Box::new(StandaloneContext::default()),
    )
    .with_census(Box::new(NoCensus))
}

fn assign_meta(jid: u64, callable_len: usize) -> Meta {
    Meta::typed(names::ASSIGN)
        .with("jid", jid)
        .with("payload_parts", json!([callable_len, 0]))
        .with("api_key", "k")
        .with("api_secretkey", "secret")
        .with("server_url", "http://localhost/")
}

#[test]
fn test_sigterm_kills_running_job_and_worker() {
    let _turn = exclusive();
    let (boss_end, employee_end) = UnixStream::pair().unwrap();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    let worker = thread::spawn(move || {
        let registry = FunctionRegistry::new();
        registry.register_function("spin", move |job, _args, _kwargs| {
            let _ = started_tx.send(());
            loop {
                job.checkpoint()?;
                thread::sleep(Duration::from_millis(5));
            }
        });
        let channel = Channel::open(employee_end).unwrap();
        let mut worker = Worker::new(channel, executor(registry), LogContext::new());
        worker.run()
    });

    let boss = Channel::open(boss_end).unwrap();
    let callable = serde_json::to_vec(&CallableRef::named("spin")).unwrap();
    boss.send(&assign_meta(99, callable.len()), &callable, None).unwrap();

    assert_eq!(boss.read().unwrap().kind(), names::PROCESSING);
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    raise(Signal::SIGTERM).unwrap();

    let finished = boss.read().unwrap();
    assert_eq!(finished.kind(), names::FINISHED);
    assert_eq!(finished.meta.get("traceback"), Some(&json!(true)));
    assert!(String::from_utf8(finished.payload).unwrap().contains("Killed"));

    let exit = worker.join().unwrap();
    assert!(matches!(exit, LoopExit::Terminated(TerminateReason::Killed)));
}

#[derive(Default)]
struct Collected(Mutex<Vec<Report>>);

impl Outbox for Collected {
    fn deliver(&self, report: Report) -> ChannelResult<()> {
        self.0.lock().unwrap().push(report);
        Ok(())
    }
}

#[test]
fn test_failure_after_sigterm_is_still_a_kill() {
    let _turn = exclusive();
    let registry = FunctionRegistry::new();
    registry.register_function("give_up", |_job, _args, _kwargs| {
        raise(Signal::SIGTERM).map_err(|e| JobError::failed(e.to_string()))?;
        Err(JobError::failed("could not finish"))
    });
    let mut executor = executor(registry);

    let callable = serde_json::to_vec(&CallableRef::named("give_up")).unwrap();
    let job = Assignment {
        jid: 5,
        ujid: None,
        core_type: "c1".into(),
        cores: 1,
        payload_parts: vec![callable.len(), 0],
        job_type: Some(JobKind::Plain),
        profile: false,
        fast_serialization: 0,
        credentials: Credentials {
            api_key: "k".into(),
            api_secretkey: "secret".into(),
            server_url: "http://localhost/".into(),
        },
    };
    let outbox = Collected::default();

    assert_eq!(
        executor.execute(&job, &callable, &outbox),
        Disposition::Terminate(TerminateReason::Killed)
    );
    let reports = outbox.0.into_inner().unwrap();
    let Some(Report::Finished {
        traceback, payload, ..
    }) = reports.last()
    else {
        panic!("expected finished, got {:?}", reports);
    };
    assert!(*traceback);
    assert!(String::from_utf8_lossy(payload).contains("Killed"));
}

/// Employee binary that is killed if the test ends early.
struct Employee(Child);

impl Drop for Employee {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Whether `pid` has a SIGTERM handler installed.
fn catches_sigterm(pid: u32) -> bool {
    let Ok(status) = fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("SigCgt:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .is_some_and(|mask| mask & (1 << (Signal::SIGTERM as i32 - 1)) != 0)
}

#[test]
fn test_job_that_never_checks_in_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(socket_path(dir.path(), 7002)).unwrap();
    let mut employee = Employee(
        Command::new(env!("CARGO_BIN_EXE_employee"))
            .arg("--no-containment")
            .env(env::SERVER_ADDRESS, dir.path())
            .env(env::SERVER_PORT, "7002")
            .env(env::QDESC, "queue-kill")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    );
    let pid = employee.0.id();

    let (stream, _) = listener.accept().unwrap();
    let boss = Channel::open(stream).unwrap();
    assert_eq!(boss.read().unwrap().kind(), names::INFO);
    let log = tempfile::tempfile().unwrap();
    boss.send(&Meta::typed(names::SETUP), &[], Some(OwnedFd::from(log)))
        .unwrap();

    let callable = serde_json::to_vec(&CallableRef::named("burn")).unwrap();
    let args = b"[60]".to_vec();
    let meta = assign_meta(77, callable.len()).with("payload_parts", json!([callable.len(), args.len()]));
    boss.send(&meta, &[callable, args].concat(), None).unwrap();
    assert_eq!(boss.read().unwrap().kind(), names::PROCESSING);

    let waiting = Instant::now();
    while !catches_sigterm(pid) {
        assert!(waiting.elapsed() < Duration::from_secs(10), "job never started");
        thread::sleep(Duration::from_millis(10));
    }
    let killed = Instant::now();
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).unwrap();

    let finished = boss.read().unwrap();
    assert_eq!(finished.kind(), names::FINISHED);
    assert_eq!(finished.meta.get("traceback"), Some(&json!(true)));
    assert!(String::from_utf8(finished.payload).unwrap().contains("Killed"));
    assert!(killed.elapsed() < Duration::from_secs(20), "job ran to completion");

    let status = employee.0.wait().unwrap();
    assert!(status.success(), "{:?}", status);
}
