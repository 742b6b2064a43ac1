use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Process-wide monotonic counters.
///
/// All fields are atomics because the watchdog thread and allocator hooks
/// read them while the fuzzing thread increments; each counter only ever
/// grows.
#[derive(Debug)]
pub struct Stats {
    pub total_runs: AtomicU64,
    pub new_units_added: AtomicUsize,
    pub diff_units_added: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub valid_cases: AtomicUsize,
    pub time_of_longest_unit_sec: AtomicU64,
    pub peak_rss_mb: AtomicUsize,
    /// Mirror of the oracle's total PC coverage, refreshed by the driver
    /// after every run so exit paths on other threads can report it.
    pub total_pc_coverage: AtomicUsize,
    process_start: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_runs: AtomicU64::new(0),
            new_units_added: AtomicUsize::new(0),
            diff_units_added: AtomicUsize::new(0),
            duplicates: AtomicUsize::new(0),
            valid_cases: AtomicUsize::new(0),
            time_of_longest_unit_sec: AtomicU64::new(0),
            peak_rss_mb: AtomicUsize::new(0),
            total_pc_coverage: AtomicUsize::new(0),
            process_start: Instant::now(),
        }
    }

    pub fn seconds_since_start(&self) -> u64 {
        self.process_start.elapsed().as_secs()
    }

    pub fn exec_per_sec(&self) -> u64 {
        let secs = self.seconds_since_start();
        if secs == 0 {
            return 0;
        }
        self.total_runs.load(Ordering::Relaxed) / secs
    }

    /// Re-reads the process peak RSS and folds it into the counter.
    pub fn refresh_peak_rss(&self) -> usize {
        let rss = peak_rss_mb();
        self.peak_rss_mb.fetch_max(rss, Ordering::Relaxed);
        rss
    }

    /// The `stat::` summary block printed on every exit path.
    pub fn print_final(&self, differential_mode: bool) {
        self.refresh_peak_rss();
        println!(
            "stat::number_of_executed_units: {}",
            self.total_runs.load(Ordering::Relaxed)
        );
        println!("stat::average_exec_per_sec:     {}", self.exec_per_sec());
        println!(
            "stat::new_units_added:          {}",
            self.new_units_added.load(Ordering::Relaxed)
        );
        if differential_mode {
            println!(
                "stat::number_of_diffs:          {}",
                self.diff_units_added.load(Ordering::Relaxed)
            );
            println!(
                "stat::number_of_valid_cases:    {}",
                self.valid_cases.load(Ordering::Relaxed)
            );
        }
        println!(
            "stat::slowest_unit_time_sec:    {}",
            self.time_of_longest_unit_sec.load(Ordering::Relaxed)
        );
        println!(
            "stat::peak_rss_mb:              {}",
            self.peak_rss_mb.load(Ordering::Relaxed)
        );
        println!(
            "stat::number_of_duplicates:     {}",
            self.duplicates.load(Ordering::Relaxed)
        );
        println!(
            "stat::coverage:                 {}",
            self.total_pc_coverage.load(Ordering::Relaxed)
        );
    }
}

/// Peak resident set size of this process in megabytes.
#[cfg(unix)]
pub fn peak_rss_mb() -> usize {
    use core::mem;
    let usage = unsafe {
        let mut usage = mem::MaybeUninit::<libc::rusage>::uninit();
        if libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) != 0 {
            return 0;
        }
        usage.assume_init()
    };
    // ru_maxrss is kilobytes on Linux, bytes on macOS.
    #[cfg(target_os = "macos")]
    let mb = usage.ru_maxrss >> 20;
    #[cfg(not(target_os = "macos"))]
    let mb = usage.ru_maxrss >> 10;
    mb.max(0) as usize
}

#[cfg(not(unix))]
pub fn peak_rss_mb() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.total_runs.load(Ordering::Relaxed), 0);
        assert_eq!(stats.exec_per_sec(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn peak_rss_is_positive_on_unix() {
        assert!(peak_rss_mb() > 0);
    }

    #[test]
    fn refresh_folds_rss_into_counter() {
        let stats = Stats::new();
        let rss = stats.refresh_peak_rss();
        assert_eq!(stats.peak_rss_mb.load(Ordering::Relaxed), rss);
        // A second refresh never lowers the recorded peak.
        stats.peak_rss_mb.store(usize::MAX, Ordering::Relaxed);
        stats.refresh_peak_rss();
        assert_eq!(stats.peak_rss_mb.load(Ordering::Relaxed), usize::MAX);
    }
}
