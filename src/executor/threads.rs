//! Thread census.
//!
//! A worker whose job left threads running cannot be reused safely. The
//! executor snapshots the process's threads before a job and compares after.

use std::fmt;

/// One OS thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u64,
    pub name: String,
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tid {})", self.name, self.tid)
    }
}

/// Lists the threads of the current process.
pub trait ThreadCensus: Send {
    /// `None` when the platform cannot enumerate threads; leak checks are
    /// skipped then.
    fn snapshot(&self) -> Option<Vec<ThreadInfo>>;
}

/// Reads `/proc/self/task`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcTaskCensus;

impl ThreadCensus for ProcTaskCensus {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> Option<Vec<ThreadInfo>> {
        let entries = std::fs::read_dir("/proc/self/task").ok()?;
        let mut threads: Vec<ThreadInfo> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let tid = entry.file_name().to_str()?.parse::<u64>().ok()?;
                let name = std::fs::read_to_string(entry.path().join("comm"))
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default();
                Some(ThreadInfo { tid, name })
            })
            .collect();
        threads.sort_by_key(|t| t.tid);
        Some(threads)
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> Option<Vec<ThreadInfo>> {
        None
    }
}

/// Never sees any threads, which turns leak checks off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCensus;

impl ThreadCensus for NoCensus {
    fn snapshot(&self) -> Option<Vec<ThreadInfo>> {
        None
    }
}

/// Threads in `after` that were not in `before`.
pub fn new_threads(before: &[ThreadInfo], after: &[ThreadInfo]) -> Vec<ThreadInfo> {
    after
        .iter()
        .filter(|t| !before.iter().any(|b| b.tid == t.tid))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(tid: u64, name: &str) -> ThreadInfo {
        ThreadInfo {
            tid,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_new_threads() {
        let before = vec![thread(1, "main"), thread(2, "employee-send")];
        let after = vec![thread(1, "main"), thread(2, "employee-send"), thread(9, "poller")];
        assert_eq!(new_threads(&before, &after), vec![thread(9, "poller")]);
        assert!(new_threads(&after, &before).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_census_sees_current_thread() {
        let threads = ProcTaskCensus.snapshot().unwrap();
        let tid = nix::unistd::gettid().as_raw() as u64;
        assert!(threads.iter().any(|t| t.tid == tid));
    }

    #[test]
    fn test_display() {
        assert_eq!(thread(7, "poller").to_string(), "poller (tid 7)");
    }
}
