//! Execution statistics.
//!
//! Counters are updated with relaxed atomics and read without any locking;
//! a snapshot taken while operations are in flight may be slightly stale,
//! which is acceptable for reporting.

use {
    crate::retry::{TryClass, MAX_MAX_TRIES},
    std::{
        collections::BTreeMap,
        fmt::Write as _,
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
            Mutex,
        },
        time::Duration,
    },
};

struct ClassStats {
    // indexed by attempts taken; slot 0 is unused
    attempts: [AtomicU32; MAX_MAX_TRIES + 1],
    failed: AtomicU32,
    calls: AtomicU32,
    successes: AtomicU32,
    elapsed_ns: AtomicU64,
}

impl ClassStats {
    fn new() -> Self {
        ClassStats {
            attempts: std::array::from_fn(|_| AtomicU32::new(0)),
            failed: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            elapsed_ns: AtomicU64::new(0),
        }
    }
}

/// Per-retry-class counters plus optional per-call profiling.
pub struct Stats {
    classes: [ClassStats; TryClass::COUNT],
    profiling: AtomicBool,
    profile: Mutex<BTreeMap<&'static str, (u64, u64)>>,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            classes: std::array::from_fn(|_| ClassStats::new()),
            profiling: AtomicBool::new(false),
            profile: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Stats {
    /// Record one finished operation.
    ///
    /// `attempts` is the number of I/O attempts actually made; failed
    /// operations land in the failure bucket instead of the histogram.
    pub fn record(&self, class: TryClass, attempts: usize, success: bool, elapsed: Duration) {
        let c = &self.classes[class as usize];
        c.calls.fetch_add(1, Ordering::Relaxed);
        c.elapsed_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if success {
            c.successes.fetch_add(1, Ordering::Relaxed);
            let slot = attempts.min(MAX_MAX_TRIES);
            c.attempts[slot].fetch_add(1, Ordering::Relaxed);
        } else {
            c.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Successful-operation count for one histogram bucket.
    pub fn attempts_bucket(&self, class: TryClass, attempts: usize) -> u32 {
        self.classes[class as usize].attempts[attempts.min(MAX_MAX_TRIES)].load(Ordering::Relaxed)
    }

    /// Operations that exhausted their retries or failed fatally.
    pub fn failed_count(&self, class: TryClass) -> u32 {
        self.classes[class as usize].failed.load(Ordering::Relaxed)
    }

    /// Total operations recorded for a class.
    pub fn call_count(&self, class: TryClass) -> u32 {
        self.classes[class as usize].calls.load(Ordering::Relaxed)
    }

    /// Enable or disable per-call profiling.
    pub fn set_profiling(&self, on: bool) {
        self.profiling.store(on, Ordering::Relaxed);
    }

    /// Record one profiled library call, if profiling is enabled.
    pub fn profile_call(&self, name: &'static str, elapsed: Duration) {
        if !self.profiling.load(Ordering::Relaxed) {
            return;
        }
        let mut profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());
        let entry = profile.entry(name).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += elapsed.as_nanos() as u64;
    }

    /// Render a human-readable report of all counters.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for i in 0..TryClass::COUNT {
            let class = TryClass::from_index(i);
            let c = &self.classes[i];
            let calls = c.calls.load(Ordering::Relaxed);
            if calls == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{}: {} calls, {} ok, {} failed, {:.1} ms total",
                class.name(),
                calls,
                c.successes.load(Ordering::Relaxed),
                c.failed.load(Ordering::Relaxed),
                c.elapsed_ns.load(Ordering::Relaxed) as f64 / 1e6,
            );
            for attempts in 1..=MAX_MAX_TRIES {
                let n = c.attempts[attempts].load(Ordering::Relaxed);
                if n != 0 {
                    let _ = writeln!(out, "  {} attempt(s): {}", attempts, n);
                }
            }
        }
        let profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());
        for (name, (calls, ns)) in profile.iter() {
            let _ = writeln!(out, "profile {}: {} calls, {:.1} ms", name, calls, *ns as f64 / 1e6);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_attempts() {
        let stats = Stats::default();
        stats.record(TryClass::WriteRead, 3, true, Duration::from_millis(12));
        stats.record(TryClass::WriteRead, 3, true, Duration::from_millis(9));
        stats.record(TryClass::WriteRead, 1, true, Duration::from_millis(2));
        stats.record(TryClass::WriteRead, 6, false, Duration::from_millis(80));

        assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 3), 2);
        assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 1), 1);
        assert_eq!(stats.attempts_bucket(TryClass::WriteRead, 6), 0);
        assert_eq!(stats.failed_count(TryClass::WriteRead), 1);
        assert_eq!(stats.call_count(TryClass::WriteRead), 4);
        assert_eq!(stats.call_count(TryClass::WriteOnly), 0);
    }

    #[test]
    fn profile_requires_opt_in() {
        let stats = Stats::default();
        stats.profile_call("get_vcp", Duration::from_millis(1));
        assert!(!stats.report().contains("profile"));

        stats.set_profiling(true);
        stats.profile_call("get_vcp", Duration::from_millis(1));
        assert!(stats.report().contains("profile get_vcp: 1 calls"));
    }
}
