use crate::artifact::{read_corpus_dir, ArtifactWriter};
use crate::config::FuzzOptions;
use crate::corpus::Corpus;
use crate::coverage::{CoverageOracle, TargetSet};
use crate::dedup::DedupIndex;
use crate::differential::{classify_divergence, DivergenceOutcome};
use crate::equivalence::{compare_outputs, EquivalenceChannel};
use crate::executor::{AllocTracer, Harness};
use crate::input::{ascii_dump, hex_dump, sha1_digest, sha1_hex, unit_hash, Sha1Digest, Unit};
use crate::mutator::Mutator;
use crate::stats::Stats;
use crate::watchdog::{
    exit_now, install_interrupt_handler, interrupted, spawn_watchdog, ExecState, FatalKind,
    LeakChecker, WatchdogConfig, WatchdogHandle,
};
use rand::Rng;
use rand_core::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use thiserror::Error;

const MAX_UNIT_SIZE_TO_PRINT: usize = 256;

/// Bounded retry for duplicate or unusable mutation candidates. The
/// unbounded variant can livelock on a low-entropy seed; when the cap is
/// hit the last candidate is executed anyway.
const DUPLICATE_RETRY_LIMIT: usize = 100;

/// After this many fruitless malloc/free-parity probes, leak probing is
/// disabled for the rest of the session.
const MAX_LEAK_PROBES: usize = 1000;

#[derive(Error, Debug)]
pub enum DriverError {
    /// The process-wide driver handle is initialized once and never
    /// rebound; a second live driver is rejected.
    #[error("another fuzzing driver is already live in this process")]
    AlreadyRunning,
    #[error("no target callbacks registered")]
    NoTargets,
}

static DRIVER_LIVE: AtomicBool = AtomicBool::new(false);

struct DriverGuard;

impl DriverGuard {
    fn acquire() -> Result<Self, DriverError> {
        if DRIVER_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(DriverGuard)
        } else {
            Err(DriverError::AlreadyRunning)
        }
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        DRIVER_LIVE.store(false, Ordering::SeqCst);
    }
}

/// The fuzzing driver: owns the corpus, the coverage oracle, the dedup
/// index, the harness and the mutation engine, and runs the feedback loop.
pub struct Fuzzer {
    options: FuzzOptions,
    max_input_len: usize,
    max_mutation_len: usize,
    stats: Arc<Stats>,
    corpus: Corpus,
    targets: TargetSet,
    oracle: CoverageOracle,
    dedup: DedupIndex,
    harness: Harness,
    mutator: Box<dyn Mutator>,
    artifacts: ArtifactWriter,
    exec_state: Arc<ExecState>,
    channel: Option<Box<dyn EquivalenceChannel>>,
    leak_checker: Option<Box<dyn LeakChecker>>,
    feature_set_tmp: Vec<u64>,
    unit_had_output_diff: bool,
    base_sha1: Sha1Digest,
    output_corpus_epoch: Option<SystemTime>,
    leak_probe_attempts: usize,
    detect_leaks: bool,
    loop_start: Instant,
    _watchdog: Option<WatchdogHandle>,
    _guard: DriverGuard,
}

impl Fuzzer {
    pub fn new(
        targets: TargetSet,
        mutator: Box<dyn Mutator>,
        options: FuzzOptions,
    ) -> Result<Self, DriverError> {
        if targets.is_empty() {
            return Err(DriverError::NoTargets);
        }
        let guard = DriverGuard::acquire()?;

        let oracle = CoverageOracle::new(&targets, options.use_counters, options.use_value_profile);
        let stats = Arc::new(Stats::new());
        let exec_state = Arc::new(ExecState::new());
        let alloc_tracer = Arc::new(AllocTracer::new());
        let artifacts = ArtifactWriter::from_options(&options);

        // A single allocation over the limit is policed synchronously from
        // the malloc hook.
        alloc_tracer.set_malloc_limit_mb(options.rss_limit_mb);
        {
            let exec = Arc::clone(&exec_state);
            let hook_stats = Arc::clone(&stats);
            let writer = artifacts.clone();
            let error_exitcode = options.error_exitcode;
            let differential_mode = options.differential_mode;
            alloc_tracer.set_oom_hook(Box::new(move |size| {
                println!("==ERROR: parallax: out-of-memory (malloc({size}))");
                println!("   To change the out-of-memory limit use rss-limit-mb=<N>");
                writer.write_with_prefix(
                    &exec.snapshot_unit(),
                    FatalKind::OutOfMemory.artifact_prefix(),
                );
                println!("SUMMARY: parallax: {}", FatalKind::OutOfMemory.summary());
                hook_stats.print_final(differential_mode);
                exit_now(error_exitcode);
            }));
        }

        let harness = Harness::new(
            Arc::clone(&alloc_tracer),
            Arc::clone(&exec_state),
            options.trace_malloc,
        );
        let watchdog = if options.timeout_sec > 0 {
            Some(spawn_watchdog(
                WatchdogConfig {
                    timeout_sec: options.timeout_sec,
                    error_exitcode: options.error_exitcode,
                    timeout_exitcode: options.timeout_exitcode,
                    differential_mode: options.differential_mode,
                },
                Arc::clone(&exec_state),
                Arc::clone(&stats),
                artifacts.clone(),
            ))
        } else {
            None
        };
        install_interrupt_handler();

        let max_input_len = options.effective_max_len();
        if options.max_len == 0 && options.verbosity > 0 {
            println!(
                "INFO: max-len is not provided; parallax will not generate inputs \
                 larger than {max_input_len} bytes"
            );
        }
        let detect_leaks = options.detect_leaks;
        Ok(Self {
            options,
            max_input_len,
            max_mutation_len: max_input_len,
            stats,
            corpus: Corpus::new(),
            targets,
            oracle,
            dedup: DedupIndex::new(),
            harness,
            mutator,
            artifacts,
            exec_state,
            channel: None,
            leak_checker: None,
            feature_set_tmp: Vec::new(),
            unit_had_output_diff: false,
            base_sha1: [0; 20],
            output_corpus_epoch: None,
            leak_probe_attempts: 0,
            detect_leaks,
            loop_start: Instant::now(),
            _watchdog: watchdog,
            _guard: guard,
        })
    }

    /// Attaches a cross-process equivalence channel.
    pub fn set_equivalence_channel(&mut self, channel: Box<dyn EquivalenceChannel>) {
        self.channel = Some(channel);
    }

    /// Attaches a leak checker; without one, leak probing degrades to a
    /// no-op.
    pub fn set_leak_checker(&mut self, checker: Box<dyn LeakChecker>) {
        self.leak_checker = Some(checker);
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn oracle(&self) -> &CoverageOracle {
        &self.oracle
    }

    pub fn options(&self) -> &FuzzOptions {
        &self.options
    }

    /// Replays the initial corpus, then runs the mutation loop until an
    /// exit condition is met.
    pub fn run(&mut self, initial_corpus: Vec<Unit>) {
        self.shuffle_and_minimize(initial_corpus);
        self.fuzz_loop();
    }

    fn execute_callback(&mut self, module: usize, data: &[u8]) -> i32 {
        let result = self.harness.execute_callback(
            &mut self.targets,
            module,
            data,
            &mut self.oracle,
            self.channel.as_deref_mut(),
        );
        match result {
            Ok(code) => code,
            Err(error) => {
                println!("==ERROR: parallax: {error}");
                self.fatal(FatalKind::Crash)
            }
        }
    }

    /// Runs one input through the pipeline; returns whether it was
    /// interesting. `existing` names the corpus entry the input was
    /// mutated from, enabling in-place replacement.
    pub fn run_one(&mut self, data: &[u8], existing: Option<usize>) -> bool {
        let interesting = if self.options.differential_mode {
            self.run_differential(data, existing)
        } else {
            self.run_one_callback(data, 0, existing)
        };
        let runs = self.stats.total_runs.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats
            .total_pc_coverage
            .store(self.oracle.total_pc_coverage(), Ordering::Relaxed);
        self.rss_check();
        if runs % 20 == 0 {
            self.artifacts.append_progress_log(
                runs,
                self.stats.duplicates.load(Ordering::Relaxed),
                self.stats.diff_units_added.load(Ordering::Relaxed),
                self.stats.valid_cases.load(Ordering::Relaxed),
            );
        }
        interesting
    }

    /// Differential decision procedure: run all N callbacks, then judge
    /// the run on the coverage and disagreement axes independently.
    fn run_differential(&mut self, data: &[u8], existing: Option<usize>) -> bool {
        self.oracle.reset_coverage();
        self.unit_had_output_diff = false;
        let coverage_before = self.oracle.total_pc_coverage();

        let mut callbacks_with_new_features = 0usize;
        let mut progress_pattern = Vec::with_capacity(self.targets.len());
        for module in 0..self.targets.len() {
            let produced_new_features = self.run_one_callback(data, module, existing);
            callbacks_with_new_features += usize::from(produced_new_features);
            progress_pattern.push(produced_new_features);
        }
        let coverage_delta = self.oracle.total_pc_coverage() - coverage_before;

        let new_diff = self.oracle.new_output_diff_change();
        if self.oracle.new_trace_diff(&progress_pattern) {
            self.stats.valid_cases.fetch_add(1, Ordering::Relaxed);
        }
        if new_diff {
            self.feature_set_tmp.clear();
            match classify_divergence(&self.oracle, &mut self.dedup) {
                DivergenceOutcome::NoDisagreement => {}
                DivergenceOutcome::Duplicate(_) => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                DivergenceOutcome::New { tag, fingerprint } => {
                    self.unit_had_output_diff = true;
                    self.stats.diff_units_added.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "new divergence {} (outputs {:?})",
                        sha1_hex(&fingerprint),
                        self.oracle.output_diff_vec
                    );
                    self.artifacts.write_with_prefix(data, &format!("diff_{tag}"));
                }
            }
            if self.unit_had_output_diff {
                // The divergence itself, not the features, justifies
                // retention.
                self.corpus
                    .add_to_corpus(data.to_vec(), coverage_delta, true, Vec::new());
            }
        }
        callbacks_with_new_features > 0 || new_diff
    }

    /// Executes one callback and applies the feature-based retention
    /// policy. Returns whether the input produced new features (or
    /// replaced an existing entry).
    fn run_one_callback(&mut self, data: &[u8], module: usize, existing: Option<usize>) -> bool {
        if data.is_empty() {
            return false;
        }
        let code = self.execute_callback(module, data);
        if self.options.differential_mode {
            self.oracle.output_diff_vec[module] = code;
        }

        self.feature_set_tmp.clear();
        let updates_before = self.corpus.num_feature_updates();
        let corpus = &mut self.corpus;
        let feature_set_tmp = &mut self.feature_set_tmp;
        let shrink = self.options.shrink;
        let reduce_inputs = self.options.reduce_inputs;
        let size = data.len();
        self.oracle.collect_features(|feature| {
            corpus.add_feature(feature, size, shrink);
            if reduce_inputs {
                feature_set_tmp.push(feature);
            }
        });
        self.report_pulse_and_slow_input(data);

        let num_new_features = self.corpus.num_feature_updates() - updates_before;
        if num_new_features > 0 {
            self.corpus.add_to_corpus(
                data.to_vec(),
                num_new_features,
                true,
                self.feature_set_tmp.clone(),
            );
            self.check_exit_on_src_pos_or_item();
            return true;
        }
        if let Some(id) = existing {
            if self.corpus.try_replace(id, data, &self.feature_set_tmp) {
                self.check_exit_on_src_pos_or_item();
                return true;
            }
        }
        false
    }

    /// One iteration of the main loop: pick a seed, mutate it
    /// `mutate_depth` times, execute every non-duplicate candidate.
    fn mutate_and_test_one(&mut self) {
        self.mutator.start_mutation_sequence();

        let prefer_small = self.options.prefer_small;
        let id = match self
            .corpus
            .choose_unit_to_mutate(self.mutator.rng(), prefer_small)
        {
            Ok(id) => id,
            Err(_) => return,
        };
        let entry = self.corpus.entry(id);
        self.base_sha1 = entry.sha1;
        let mut unit = entry.unit.clone();
        debug_assert!(unit.len() <= self.max_input_len, "oversized unit");

        let current_max_mutation_len = if self.options.experimental_len_control {
            compute_mutation_len(
                self.corpus.max_input_size(),
                self.max_mutation_len,
                self.mutator.rng(),
            )
        } else {
            self.max_mutation_len
        };

        for _ in 0..self.options.mutate_depth {
            if self.stats.total_runs.load(Ordering::Relaxed) >= self.options.effective_max_runs() {
                break;
            }
            let mut previous = unit.clone();
            for _retry in 0..DUPLICATE_RETRY_LIMIT {
                previous = unit.clone();
                let new_size = {
                    let crossover = if self.options.do_cross_over {
                        Some(&self.corpus)
                    } else {
                        None
                    };
                    self.mutator
                        .mutate(&mut unit, current_max_mutation_len, crossover)
                };
                assert!(new_size > 0, "mutation engine returned an empty unit");
                assert!(
                    new_size <= current_max_mutation_len,
                    "mutation engine returned an oversized unit"
                );
                if self.dedup.note_mutation(sha1_digest(&unit)) {
                    break;
                }
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            self.corpus.entry_mut(id).num_executed_mutations += 1;
            if self.run_one(&unit, Some(id)) {
                self.report_new_coverage(id, &unit);
                if self.unit_had_output_diff {
                    // Archive the pre-mutation bytes for root-cause work.
                    let kind = format!("{}_BeforeMutationWas_", unit_hash(&unit));
                    self.artifacts.write_with_prefix(&previous, &kind);
                }
            }
            self.try_detecting_a_memory_leak(&unit, false);
        }
    }

    fn report_new_coverage(&mut self, id: usize, unit: &[u8]) {
        self.corpus.entry_mut(id).num_successful_mutations += 1;
        self.mutator.record_successful_mutation_sequence();
        self.print_status_for_new_unit(unit);
        self.artifacts.write_to_output_corpus(unit);
        self.stats.new_units_added.fetch_add(1, Ordering::Relaxed);
        self.print_new_pcs();
    }

    fn print_new_pcs(&mut self) {
        let new_pcs = self.oracle.drain_new_pcs();
        if self.options.print_new_cov_pcs {
            for pc in new_pcs {
                println!("\tNEW_PC: {pc:#x}");
            }
        }
    }

    fn print_status_for_new_unit(&mut self, unit: &[u8]) {
        if !self.options.print_new {
            return;
        }
        self.print_stats("NEW   ", "");
        if self.options.verbosity > 0 {
            print!(" L: {} ", unit.len());
            self.mutator.print_mutation_sequence();
            println!();
        }
    }

    /// Replays the initial corpus through the full pipeline and keeps the
    /// interesting part.
    pub fn shuffle_and_minimize(&mut self, mut initial_corpus: Vec<Unit>) {
        if self.options.verbosity > 0 {
            println!("#0\tREAD units: {}", initial_corpus.len());
        }
        if self.options.shuffle_at_startup {
            let rng = self.mutator.rng();
            for i in (1..initial_corpus.len()).rev() {
                let j = rng.random_range(0..=i);
                initial_corpus.swap(i, j);
            }
        }
        if self.options.prefer_small {
            initial_corpus.sort_by_key(|unit| unit.len());
        }

        // Probe the callbacks once with empty input and never again.
        for module in 0..self.targets.len() {
            self.execute_callback(module, &[]);
        }

        for unit in &initial_corpus {
            let mut unit = unit.clone();
            unit.truncate(self.max_input_len);
            if self.run_one(&unit, None) {
                self.mutator.record_successful_mutation_sequence();
                self.print_status_for_new_unit(&unit);
                self.stats.new_units_added.fetch_add(1, Ordering::Relaxed);
                self.print_new_pcs();
            }
            if self.stats.total_runs.load(Ordering::Relaxed) >= self.options.effective_max_runs() {
                break;
            }
            self.try_detecting_a_memory_leak(&unit, true);
        }
        self.print_stats("INITED", "\n");
        if self.corpus.is_empty() {
            println!(
                "ERROR: no interesting inputs were found. \
                 Is the coverage instrumentation wired up? Exiting."
            );
            std::process::exit(1);
        }
    }

    /// The main loop. Exits on the runs bound, the wall-clock bound, or an
    /// interrupt.
    pub fn fuzz_loop(&mut self) {
        self.loop_start = Instant::now();
        let mut last_corpus_reload = Instant::now();
        loop {
            if interrupted() {
                self.interrupt_exit();
            }
            if self.options.reload_interval_sec > 0
                && last_corpus_reload.elapsed().as_secs() >= self.options.reload_interval_sec
            {
                self.reread_output_corpus();
                last_corpus_reload = Instant::now();
            }
            if self.stats.total_runs.load(Ordering::Relaxed) >= self.options.effective_max_runs() {
                break;
            }
            if self.timed_out() {
                break;
            }
            self.mutate_and_test_one();
        }
        self.print_stats("DONE  ", "\n");
        self.print_final_stats();
    }

    fn timed_out(&self) -> bool {
        self.options.max_total_time_sec > 0
            && self.loop_start.elapsed().as_secs() >= self.options.max_total_time_sec
    }

    fn interrupt_exit(&mut self) -> ! {
        println!("==parallax: run interrupted; exiting");
        self.print_final_stats();
        exit_now(0)
    }

    /// Picks up units written into the output corpus by other sessions.
    fn reread_output_corpus(&mut self) {
        let Some(dir) = self.artifacts.output_corpus().map(|p| p.to_path_buf()) else {
            return;
        };
        let units = read_corpus_dir(&dir, self.max_input_len, &mut self.output_corpus_epoch);
        if self.options.verbosity >= 2 {
            log::debug!("reload: read {} new units", units.len());
        }
        let mut reloaded = false;
        for unit in units {
            if !self.corpus.has_unit(&unit) && self.run_one(&unit, None) {
                reloaded = true;
            }
        }
        if reloaded {
            self.print_stats("RELOAD", "\n");
        }
    }

    fn check_exit_on_src_pos_or_item(&mut self) {
        if let Some(pattern) = &self.options.exit_on_src_pos {
            let hit = self
                .oracle
                .observed_pcs()
                .iter()
                .any(|pc| format!("{pc:#x}").contains(pattern.as_str()));
            if hit {
                println!("INFO: found a PC matching '{pattern}', exiting.");
                exit_now(0);
            }
        }
        if let Some(item) = &self.options.exit_on_item {
            if self.corpus.has_unit_hash(item) {
                println!("INFO: found item with checksum '{item}', exiting.");
                exit_now(0);
            }
        }
    }

    /// Cheap parity pre-check, then the expensive leak check, on the input
    /// that was just executed.
    fn try_detecting_a_memory_leak(&mut self, data: &[u8], during_initial_corpus_execution: bool) {
        if !self.harness.has_more_mallocs_than_frees {
            return;
        }
        if !self.detect_leaks {
            return;
        }
        let Some(mut checker) = self.leak_checker.take() else {
            return;
        };
        // Run the target once more with leak checking off so a real leak
        // is not reported twice.
        checker.disable();
        let module = self.targets.len() - 1;
        let _ = self.harness.execute_callback(
            &mut self.targets,
            module,
            data,
            &mut self.oracle,
            self.channel.as_deref_mut(),
        );
        checker.enable();
        if !self.harness.has_more_mallocs_than_frees {
            self.leak_checker = Some(checker);
            return;
        }
        self.leak_probe_attempts += 1;
        if self.leak_probe_attempts > MAX_LEAK_PROBES {
            self.detect_leaks = false;
            println!(
                "INFO: parallax disabled leak detection after every mutation.\n\
                 \x20     Most likely the target accumulates allocated memory in a\n\
                 \x20     global state without actually leaking it."
            );
            self.leak_checker = Some(checker);
            return;
        }
        if checker.do_recoverable_leak_check() {
            if during_initial_corpus_execution {
                println!("\nINFO: a leak has been found in the initial corpus.\n");
            }
            self.exec_state.set_current_unit(data);
            self.fatal(FatalKind::Leak);
        }
        self.leak_checker = Some(checker);
    }

    /// Equivalence protocol endpoint: the server publishes its output, the
    /// client compares and dies on the first disagreement.
    pub fn announce_output(&mut self, data: &[u8]) {
        let Some(channel) = self.channel.as_deref_mut() else {
            return;
        };
        if channel.is_server() {
            channel.write_bytes(data);
        } else if channel.is_client() {
            channel.post_client();
            channel.wait_server();
            let other = channel.read_bytes();
            if let Some(mismatch) = compare_outputs(data, &other) {
                println!(
                    "==ERROR: parallax: equivalence-mismatch. Sizes: {} {}; offset {}",
                    mismatch.our_size, mismatch.their_size, mismatch.offset
                );
                self.fatal(FatalKind::Mismatch);
            }
        }
    }

    fn rss_check(&mut self) {
        if self.options.rss_limit_mb == 0 {
            return;
        }
        let rss = self.stats.refresh_peak_rss();
        if rss > self.options.rss_limit_mb {
            println!(
                "==ERROR: parallax: out-of-memory (used: {rss}Mb; limit: {}Mb)",
                self.options.rss_limit_mb
            );
            println!("   To change the out-of-memory limit use rss-limit-mb=<N>");
            self.fatal(FatalKind::OutOfMemory);
        }
    }

    fn report_pulse_and_slow_input(&mut self, data: &[u8]) {
        let runs = self.stats.total_runs.load(Ordering::Relaxed);
        if runs > 1 && runs & (runs - 1) == 0 && self.stats.seconds_since_start() >= 2 {
            self.print_stats("pulse ", "\n");
        }
        if self.options.report_slow_units == 0 {
            return;
        }
        let seconds = self.harness.last_unit_time.as_secs_f64();
        let longest = self.stats.time_of_longest_unit_sec.load(Ordering::Relaxed);
        if seconds > longest as f64 * 1.1 && seconds >= self.options.report_slow_units as f64 {
            self.stats
                .time_of_longest_unit_sec
                .store(seconds as u64, Ordering::Relaxed);
            println!("Slowest unit: {} s:", seconds as u64);
            self.artifacts.write_with_prefix(data, "slow-unit-");
        }
    }

    fn print_stats(&self, whence: &str, end: &str) {
        if self.options.verbosity == 0 {
            return;
        }
        let mut line = format!(
            "#{}\t{whence}",
            self.stats.total_runs.load(Ordering::Relaxed)
        );
        let coverage = self.oracle.total_pc_coverage();
        if coverage > 0 {
            line.push_str(&format!(" cov: {coverage}"));
        }
        let features = self.corpus.num_features();
        if features > 0 {
            line.push_str(&format!(" ft: {features}"));
        }
        if !self.corpus.is_empty() {
            line.push_str(&format!(
                " corp: {}/{}",
                self.corpus.num_active_units(),
                format_bytes(self.corpus.size_in_bytes())
            ));
        }
        line.push_str(&format!(
            " exec/s: {} rss: {}Mb",
            self.stats.exec_per_sec(),
            self.stats.peak_rss_mb.load(Ordering::Relaxed)
        ));
        print!("{line}{end}");
    }

    fn print_final_stats(&self) {
        if self.options.print_coverage {
            for pc in self.oracle.observed_pcs() {
                println!("COVERED: {pc:#x}");
            }
        }
        if self.options.dump_coverage {
            let dump: String = self
                .oracle
                .observed_pcs()
                .iter()
                .map(|pc| format!("{pc:#x}\n"))
                .collect();
            let path = format!("{}coverage.dump", self.options.artifact_prefix);
            if let Err(e) = std::fs::write(&path, dump) {
                log::warn!("failed to dump coverage to {path}: {e}");
            }
        }
        if self.options.print_corpus_stats {
            for entry in self.corpus.entries() {
                println!(
                    "CORPUS: {} len: {} executed: {} succeeded: {}",
                    sha1_hex(&entry.sha1),
                    entry.unit.len(),
                    entry.num_executed_mutations,
                    entry.num_successful_mutations
                );
            }
        }
        if !self.options.print_final_stats {
            return;
        }
        self.stats.print_final(self.options.differential_mode);
    }

    fn dump_current_unit(&mut self, prefix: &str) {
        self.mutator.print_mutation_sequence();
        println!("; base unit: {}", sha1_hex(&self.base_sha1));
        let unit = self.exec_state.snapshot_unit();
        if unit.len() <= MAX_UNIT_SIZE_TO_PRINT {
            println!("{}", hex_dump(&unit));
            println!("{}", ascii_dump(&unit));
        }
        self.artifacts.write_with_prefix(&unit, prefix);
    }

    fn fatal(&mut self, kind: FatalKind) -> ! {
        self.dump_current_unit(kind.artifact_prefix());
        println!("SUMMARY: parallax: {}", kind.summary());
        self.print_final_stats();
        exit_now(kind.exit_code(self.options.error_exitcode, self.options.timeout_exitcode))
    }
}

/// Experimental length control: start from the largest corpus unit and
/// occasionally grow, clamped to the configured mutation length.
fn compute_mutation_len(
    max_input_size: usize,
    max_mutation_len: usize,
    rng: &mut dyn RngCore,
) -> usize {
    if max_input_size == 0 || max_input_size >= max_mutation_len {
        return max_mutation_len;
    }
    let mut result = max_input_size;
    let r = rng.next_u64();
    if r % (1 << 7) == 0 {
        result += 1;
    }
    if r % (1 << 15) == 0 {
        result += 10 + result / 2;
    }
    result.min(max_mutation_len)
}

fn format_bytes(n: usize) -> String {
    if n < 1 << 14 {
        format!("{n}b")
    } else if n < 1 << 24 {
        format!("{}Kb", n >> 10)
    } else {
        format!("{}Mb", n >> 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::TargetSet;
    use crate::mutator::ByteMutator;
    use rand_core::SeedableRng;
    use std::sync::Mutex;

    // Only one live driver per process: serialize the driver tests.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_options(differential: bool) -> FuzzOptions {
        let mut options = FuzzOptions::default();
        options.differential_mode = differential;
        options.verbosity = 0;
        options.timeout_sec = 0; // no watchdog thread in tests
        options.rss_limit_mb = 0;
        options.save_artifacts = false;
        options.detect_leaks = false;
        options.shuffle_at_startup = false;
        options.log_path = std::env::temp_dir().join("parallax-test-log");
        options
    }

    /// N=2 pair: a reference parity checker and a buggy variant that
    /// rejects any input containing 0xFF.
    fn parity_targets(invocations: Option<Arc<std::sync::atomic::AtomicUsize>>) -> TargetSet {
        let mut targets = TargetSet::new();
        let counter = invocations.clone();
        targets.register("parity", vec![0x100, 0x101, 0x102], move |data, sink| {
            if let Some(counter) = &counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            sink.hit(0);
            let ones: u32 = data.iter().map(|b| b.count_ones()).sum();
            if ones % 2 == 0 {
                sink.hit(1);
            } else {
                sink.hit(2);
            }
            0
        });
        let counter = invocations;
        targets.register("parity_buggy", vec![0x200, 0x201], move |data, sink| {
            if let Some(counter) = &counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            sink.hit(0);
            if data.contains(&0xff) {
                sink.hit(1);
                return 1;
            }
            0
        });
        targets
    }

    fn fuzzer(differential: bool) -> Fuzzer {
        Fuzzer::new(
            parity_targets(None),
            Box::new(ByteMutator::new(1, false)),
            test_options(differential),
        )
        .unwrap()
    }

    #[test]
    fn second_live_driver_is_rejected() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let first = fuzzer(false);
        let second = Fuzzer::new(
            parity_targets(None),
            Box::new(ByteMutator::new(2, false)),
            test_options(false),
        );
        assert!(matches!(second, Err(DriverError::AlreadyRunning)));
        drop(first);
        // Releasing the first driver unbinds the guard.
        let third = fuzzer(false);
        drop(third);
    }

    #[test]
    fn empty_target_set_is_rejected() {
        let result = Fuzzer::new(
            TargetSet::new(),
            Box::new(ByteMutator::new(0, false)),
            test_options(false),
        );
        assert!(matches!(result, Err(DriverError::NoTargets)));
    }

    #[test]
    fn pure_coverage_retention_adds_one_unit() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // cb0 hits three new edges and agrees with cb1, which hits none.
        let mut targets = TargetSet::new();
        targets.register("covering", vec![0x100, 0x101, 0x102], |_, sink| {
            sink.hit(0);
            sink.hit(1);
            sink.hit(2);
            0
        });
        targets.register("quiet", vec![0x200], |_, _| 0);
        let mut fuzzer = Fuzzer::new(
            targets,
            Box::new(ByteMutator::new(1, false)),
            test_options(true),
        )
        .unwrap();

        assert!(fuzzer.run_one(b"\x41", None));
        assert_eq!(fuzzer.corpus().num_active_units(), 1);
        assert_eq!(fuzzer.stats().total_runs.load(Ordering::Relaxed), 1);
        assert_eq!(fuzzer.stats().diff_units_added.load(Ordering::Relaxed), 0);
        assert_eq!(fuzzer.oracle().total_pc_coverage(), 3);
    }

    #[test]
    fn novel_divergence_is_retained_and_counted() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut fuzzer = fuzzer(true);
        // Establish the all-agree baseline first.
        fuzzer.run_one(b"\x41", None);
        let corpus_before = fuzzer.corpus().num_active_units();

        // parity says 0, parity_buggy says 1: a genuine disagreement.
        assert!(fuzzer.run_one(&[0x00, 0xff], None));
        assert_eq!(fuzzer.stats().diff_units_added.load(Ordering::Relaxed), 1);
        assert!(fuzzer.corpus().num_active_units() > corpus_before);
        // The divergence-retained entry carries an empty feature set.
        let diff_entry = fuzzer.corpus().entries().last().unwrap();
        assert!(diff_entry.feature_set.is_empty());
    }

    #[test]
    fn monotonic_counters_never_decrease_across_runs() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut fuzzer = fuzzer(true);
        let mut last: (u64, usize, usize) = (0, 0, 0);
        for byte in 0u8..40 {
            fuzzer.run_one(&[byte, byte.wrapping_mul(3)], None);
            let now = (
                fuzzer.stats().total_runs.load(Ordering::Relaxed),
                fuzzer.stats().duplicates.load(Ordering::Relaxed),
                fuzzer.stats().valid_cases.load(Ordering::Relaxed),
            );
            assert!(now.0 > last.0);
            assert!(now.1 >= last.1);
            assert!(now.2 >= last.2);
            last = now;
        }
    }

    #[test]
    fn duplicate_mutations_are_skipped_without_execution() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        /// Scripted engine: returns A, A, B, then falls back to B.
        struct ScriptedMutator {
            script: Vec<Vec<u8>>,
            cursor: usize,
            rng: rand_chacha::ChaCha8Rng,
        }
        impl Mutator for ScriptedMutator {
            fn start_mutation_sequence(&mut self) {}
            fn mutate(
                &mut self,
                unit: &mut Vec<u8>,
                _max_size: usize,
                _corpus: Option<&Corpus>,
            ) -> usize {
                let next = self
                    .script
                    .get(self.cursor)
                    .unwrap_or_else(|| self.script.last().unwrap());
                self.cursor += 1;
                *unit = next.clone();
                unit.len()
            }
            fn record_successful_mutation_sequence(&mut self) {}
            fn print_mutation_sequence(&self) {}
            fn rng(&mut self) -> &mut dyn RngCore {
                &mut self.rng
            }
        }

        let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut options = test_options(false);
        options.mutate_depth = 2;
        options.runs = 0;
        let mut fuzzer = Fuzzer::new(
            parity_targets(Some(Arc::clone(&invocations))),
            Box::new(ScriptedMutator {
                script: vec![b"A".to_vec(), b"A".to_vec(), b"B".to_vec()],
                cursor: 0,
                rng: rand_chacha::ChaCha8Rng::seed_from_u64(0),
            }),
            options,
        )
        .unwrap();

        // Seed the corpus so mutate_and_test_one has something to pick.
        fuzzer.run_one(b"seed", None);
        invocations.store(0, Ordering::Relaxed);

        fuzzer.mutate_and_test_one();
        // Depth 2: candidate "A" executed once; the duplicate "A" was
        // dropped without reaching any callback; "B" executed once.
        assert_eq!(invocations.load(Ordering::Relaxed), 2);
        assert_eq!(fuzzer.stats().duplicates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn smaller_equivalent_replaces_corpus_entry_in_place() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut options = test_options(false);
        options.reduce_inputs = true;
        options.shrink = false;
        let mut fuzzer = Fuzzer::new(
            parity_targets(None),
            Box::new(ByteMutator::new(3, false)),
            options,
        )
        .unwrap();

        // "AAAA" has even parity; so does "AA": identical feature sets.
        assert!(fuzzer.run_one(b"AAAA", None));
        let id = 0;
        fuzzer.corpus.entry_mut(id).num_executed_mutations = 9;
        let features_before = fuzzer.corpus().entry(id).feature_set.clone();
        assert!(!features_before.is_empty());

        assert!(fuzzer.run_one(b"AA", Some(id)));
        let entry = fuzzer.corpus().entry(id);
        assert_eq!(entry.unit, b"AA".to_vec());
        assert_eq!(entry.feature_set, features_before);
        assert_eq!(entry.num_executed_mutations, 9);
        assert_eq!(fuzzer.corpus().num_active_units(), 1);
    }

    #[test]
    fn valid_cases_count_new_progress_patterns() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut fuzzer = fuzzer(true);
        fuzzer.run_one(b"\x41", None);
        let first = fuzzer.stats().valid_cases.load(Ordering::Relaxed);
        assert!(first >= 1);
        // A repeat of the same input advances nothing new.
        fuzzer.run_one(b"\x41", None);
        let second = fuzzer.stats().valid_cases.load(Ordering::Relaxed);
        assert!(second >= first);
    }

    #[test]
    fn announce_output_passes_on_agreement() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let (client, mut server) = crate::equivalence::pair();
        let mut fuzzer = fuzzer(false);
        fuzzer.set_equivalence_channel(Box::new(client));

        use crate::equivalence::EquivalenceChannel as _;
        server.write_bytes(b"same output");
        // Agreement: must return normally instead of exiting.
        fuzzer.announce_output(b"same output");
    }

    #[test]
    fn full_loop_respects_runs_bound() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut options = test_options(true);
        options.runs = 50;
        options.reduce_inputs = true;
        options.shrink = true;
        let mut fuzzer = Fuzzer::new(
            parity_targets(None),
            Box::new(ByteMutator::new(7, false)),
            options,
        )
        .unwrap();

        fuzzer.run(vec![vec![0x41], vec![0x00, 0x01]]);
        let runs = fuzzer.stats().total_runs.load(Ordering::Relaxed);
        assert!(runs >= 50, "loop stopped early at {runs} runs");
        assert!(!fuzzer.corpus().is_empty());
        // Every candidate that ran was registered exactly once.
        assert!(fuzzer.dedup.num_mutations() > 0);
    }

    #[test]
    fn compute_mutation_len_is_clamped() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        for _ in 0..10_000 {
            let len = compute_mutation_len(100, 120, &mut rng);
            assert!((100..=120).contains(&len));
        }
        assert_eq!(compute_mutation_len(0, 64, &mut rng), 64);
        assert_eq!(compute_mutation_len(200, 64, &mut rng), 64);
    }

    #[test]
    fn format_bytes_switches_units() {
        assert_eq!(format_bytes(100), "100b");
        assert_eq!(format_bytes(1 << 15), "32Kb");
        assert_eq!(format_bytes(1 << 25), "32Mb");
    }
}
