//! Profiling of a job run.
//!
//! A profiled job runs under a `pprof` sampling profiler. The `profile`
//! payload carries the sampled call stacks together with the job's resource
//! use from `getrusage`. Only one sampler can run per process; when another
//! is active the payload has resource totals and no samples.

use std::time::{Duration, Instant};

use nix::sys::resource::{getrusage, Usage, UsageWho};
use nix::sys::time::TimeValLike;
use pprof::{ProfilerGuard, ProfilerGuardBuilder};
use serde::{Deserialize, Serialize};

/// Samples per second.
pub const SAMPLE_FREQUENCY: i32 = 997;

/// Most stacks kept in a payload, highest count first.
const MAX_STACKS: usize = 256;

/// Libraries whose frames confuse the unwinder.
const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// One distinct call stack and how often it was sampled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSample {
    pub thread: String,
    pub count: u64,
    /// Function names, innermost first.
    pub frames: Vec<String>,
}

/// Profile of one job run, sent to the boss as a `profile` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub wall_seconds: f64,
    pub user_cpu_seconds: f64,
    pub system_cpu_seconds: f64,
    /// Peak resident set size of the process, in kilobytes.
    pub max_rss_kb: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub voluntary_context_switches: i64,
    pub involuntary_context_switches: i64,
    /// Sampling rate behind `samples`; 0 when nothing was sampled.
    #[serde(default)]
    pub sample_frequency: i32,
    #[serde(default)]
    pub samples: Vec<StackSample>,
}

impl ProfileStats {
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Total number of samples taken.
    pub fn sample_count(&self) -> u64 {
        self.samples.iter().map(|s| s.count).sum()
    }
}

/// A profiled run in progress.
pub struct Profiler {
    started: Instant,
    usage: Option<Usage>,
    sampler: Option<ProfilerGuard<'static>>,
}

fn delta(end: libc::c_long, start: libc::c_long) -> i64 {
    i64::from(end) - i64::from(start)
}

fn seconds(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

impl Profiler {
    pub fn start() -> Self {
        let sampler = ProfilerGuardBuilder::default()
            .frequency(SAMPLE_FREQUENCY)
            .blocklist(BLOCKLIST)
            .build()
            .map_err(|e| tracing::warn!(error = %e, "sampling profiler unavailable"))
            .ok();
        Self {
            started: Instant::now(),
            usage: getrusage(UsageWho::RUSAGE_SELF).ok(),
            sampler,
        }
    }

    pub fn finish(self) -> ProfileStats {
        let wall = self.started.elapsed();
        let end = getrusage(UsageWho::RUSAGE_SELF).ok();
        let samples = self.sampler.as_ref().map(collect_samples);

        let mut stats = match (self.usage, end) {
            (Some(start), Some(end)) => ProfileStats {
                wall_seconds: wall.as_secs_f64(),
                user_cpu_seconds: seconds(
                    end.user_time().num_microseconds() - start.user_time().num_microseconds(),
                ),
                system_cpu_seconds: seconds(
                    end.system_time().num_microseconds() - start.system_time().num_microseconds(),
                ),
                max_rss_kb: i64::from(end.max_rss()),
                minor_faults: delta(end.minor_page_faults(), start.minor_page_faults()),
                major_faults: delta(end.major_page_faults(), start.major_page_faults()),
                voluntary_context_switches: delta(
                    end.voluntary_context_switches(),
                    start.voluntary_context_switches(),
                ),
                involuntary_context_switches: delta(
                    end.involuntary_context_switches(),
                    start.involuntary_context_switches(),
                ),
                sample_frequency: 0,
                samples: Vec::new(),
            },
            _ => wall_only(wall),
        };
        if let Some(samples) = samples {
            stats.sample_frequency = SAMPLE_FREQUENCY;
            stats.samples = samples;
        }
        stats
    }
}

fn collect_samples(sampler: &ProfilerGuard<'static>) -> Vec<StackSample> {
    let report = match sampler.report().build() {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "could not build profile report");
            return Vec::new();
        }
    };
    let mut samples: Vec<StackSample> = report
        .data
        .iter()
        .map(|(stack, count)| StackSample {
            thread: stack.thread_name.clone(),
            count: u64::try_from(*count).unwrap_or(0),
            frames: stack.frames.iter().flatten().map(|symbol| symbol.name()).collect(),
        })
        .collect();
    samples.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.frames.cmp(&b.frames)));
    samples.truncate(MAX_STACKS);
    samples
}

fn wall_only(wall: Duration) -> ProfileStats {
    ProfileStats {
        wall_seconds: wall.as_secs_f64(),
        user_cpu_seconds: 0.0,
        system_cpu_seconds: 0.0,
        max_rss_kb: 0,
        minor_faults: 0,
        major_faults: 0,
        voluntary_context_switches: 0,
        involuntary_context_switches: 0,
        sample_frequency: 0,
        samples: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn busy_loop(until: Instant) -> u64 {
        let mut acc = 0u64;
        let mut i = 0u64;
        while Instant::now() < until {
            acc = std::hint::black_box(acc.wrapping_mul(31).wrapping_add(i));
            i += 1;
        }
        acc
    }

    #[test]
    fn test_profile_busy_loop() {
        let profiler = Profiler::start();
        let sampling = profiler.sampler.is_some();
        std::hint::black_box(busy_loop(Instant::now() + Duration::from_millis(300)));
        let stats = profiler.finish();

        assert!(stats.wall_seconds >= 0.3);
        assert!(stats.user_cpu_seconds >= 0.0);
        assert!(stats.max_rss_kb > 0);
        if sampling {
            assert_eq!(stats.sample_frequency, SAMPLE_FREQUENCY);
            assert!(stats.sample_count() > 0);
            assert!(stats.samples.windows(2).all(|w| w[0].count >= w[1].count));
        }
    }

    #[test]
    fn test_payload_is_json() {
        let mut stats = wall_only(Duration::from_millis(1500));
        stats.samples.push(StackSample {
            thread: "main".into(),
            count: 3,
            frames: vec!["job::run".into(), "main".into()],
        });
        let payload = stats.to_payload().unwrap();
        let decoded: ProfileStats = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.wall_seconds, 1.5);
        assert_eq!(decoded.samples, stats.samples);
        assert_eq!(decoded.sample_count(), 3);
    }
}
