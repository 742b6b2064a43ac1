use std::collections::HashSet;

/// A target under test. Receives a scratch copy of the input and reports
/// edge hits through the sink; the return code is its observable output.
pub type TargetCallback = Box<dyn FnMut(&mut [u8], &mut EdgeSink<'_>) -> i32>;

/// One registered callback with the PC table of its instrumented edges.
pub struct TargetModule {
    name: String,
    callback: TargetCallback,
    pcs: Vec<u64>,
}

/// The set of N callbacks exercised on every input.
#[derive(Default)]
pub struct TargetSet {
    modules: Vec<TargetModule>,
}

impl TargetSet {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a callback together with the PC values of its edges.
    /// PC values must be non-zero; zero marks an unhit slot.
    pub fn register<F>(&mut self, name: impl Into<String>, pcs: Vec<u64>, callback: F)
    where
        F: FnMut(&mut [u8], &mut EdgeSink<'_>) -> i32 + 'static,
    {
        debug_assert!(pcs.iter().all(|&pc| pc != 0));
        self.modules.push(TargetModule {
            name: name.into(),
            callback: Box::new(callback),
            pcs,
        });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.modules[idx].name
    }

    pub fn module_counts(&self) -> Vec<usize> {
        self.modules.iter().map(|m| m.pcs.len()).collect()
    }

    pub(crate) fn callback_mut(&mut self, idx: usize) -> &mut TargetCallback {
        &mut self.modules[idx].callback
    }

    fn concatenated_pcs(&self) -> Vec<u64> {
        self.modules.iter().flat_map(|m| m.pcs.iter().copied()).collect()
    }
}

/// Instrumentation seam handed to a callback for the duration of one
/// execution. Stands in for compiler-inserted coverage hooks: the callback
/// reports which of its edges it traversed, and optionally comparison
/// operands for value profiling.
pub struct EdgeSink<'a> {
    counters: &'a mut [u8],
    pc_values: &'a [u64],
    pc_slots: &'a mut [u64],
    observed: &'a mut [bool],
    total_observed: &'a mut usize,
    new_pcs: &'a mut Vec<u64>,
    value_staging: &'a mut Vec<u64>,
    value_base: u64,
    use_value_profile: bool,
}

impl EdgeSink<'_> {
    /// Records one traversal of the module-local edge `edge`.
    pub fn hit(&mut self, edge: usize) {
        let Some(counter) = self.counters.get_mut(edge) else {
            return;
        };
        *counter = counter.saturating_add(1);
        if self.pc_slots[edge] == 0 {
            self.pc_slots[edge] = self.pc_values[edge];
        }
        if !self.observed[edge] {
            self.observed[edge] = true;
            *self.total_observed += 1;
            self.new_pcs.push(self.pc_values[edge]);
        }
    }

    /// Records the operands of a comparison for value profiling.
    pub fn cmp(&mut self, site: u64, a: u64, b: u64) {
        if !self.use_value_profile || a == b {
            return;
        }
        let distance = u64::from((a ^ b).count_ones());
        self.value_staging.push(self.value_base + site * 65 + distance);
    }
}

/// Per-run coverage state for all registered callbacks, plus the histories
/// backing the three novelty tests: new coverage, new pattern of
/// disagreement, new pattern of whose coverage advanced.
pub struct CoverageOracle {
    pc_values: Vec<u64>,
    prefix: Vec<usize>,
    run_counters: Vec<u8>,
    pc_slots: Vec<u64>,
    observed: Vec<bool>,
    total_observed: usize,
    new_pcs: Vec<u64>,
    value_staging: Vec<u64>,
    value_base: u64,
    use_counters: bool,
    use_value_profile: bool,
    /// Return code of each callback for the current input.
    pub output_diff_vec: Vec<i32>,
    seen_output_patterns: HashSet<Vec<i32>>,
    seen_trace_patterns: HashSet<Vec<bool>>,
}

impl CoverageOracle {
    pub fn new(targets: &TargetSet, use_counters: bool, use_value_profile: bool) -> Self {
        let counts = targets.module_counts();
        let mut prefix = Vec::with_capacity(counts.len() + 1);
        prefix.push(0usize);
        for count in &counts {
            prefix.push(prefix.last().unwrap() + count);
        }
        let num_pcs = *prefix.last().unwrap();
        Self {
            pc_values: targets.concatenated_pcs(),
            prefix,
            run_counters: vec![0; num_pcs],
            pc_slots: vec![0; num_pcs],
            observed: vec![false; num_pcs],
            total_observed: 0,
            new_pcs: Vec::new(),
            value_staging: Vec::new(),
            value_base: num_pcs as u64 * 8,
            use_counters,
            use_value_profile,
            output_diff_vec: vec![0; targets.len()],
            seen_output_patterns: HashSet::new(),
            seen_trace_patterns: HashSet::new(),
        }
    }

    /// Clears per-callback state. Called before every callback invocation.
    pub fn reset_maps(&mut self) {
        self.run_counters.fill(0);
        self.value_staging.clear();
    }

    /// Clears run-level state. Called before a multi-callback run.
    pub fn reset_coverage(&mut self) {
        self.pc_slots.fill(0);
        self.output_diff_vec.fill(0);
    }

    pub fn edge_sink(&mut self, module: usize) -> EdgeSink<'_> {
        let lo = self.prefix[module];
        let hi = self.prefix[module + 1];
        EdgeSink {
            counters: &mut self.run_counters[lo..hi],
            pc_values: &self.pc_values[lo..hi],
            pc_slots: &mut self.pc_slots[lo..hi],
            observed: &mut self.observed[lo..hi],
            total_observed: &mut self.total_observed,
            new_pcs: &mut self.new_pcs,
            value_staging: &mut self.value_staging,
            value_base: self.value_base,
            use_value_profile: self.use_value_profile,
        }
    }

    /// Enumerates the features observed since the last `reset_maps`, in a
    /// deterministic order: edge features ascending, then value-profile
    /// features ascending.
    pub fn collect_features<F: FnMut(u64)>(&mut self, mut visit: F) {
        for (idx, &counter) in self.run_counters.iter().enumerate() {
            if counter == 0 {
                continue;
            }
            let bucket = if self.use_counters {
                counter_bucket(counter)
            } else {
                0
            };
            visit(idx as u64 * 8 + bucket);
        }
        self.value_staging.sort_unstable();
        self.value_staging.dedup();
        for &feature in &self.value_staging {
            visit(feature);
        }
    }

    /// Distinct PCs hit since process start.
    pub fn total_pc_coverage(&self) -> usize {
        self.total_observed
    }

    /// The run-scoped PC slot table: entry i holds the PC value if edge i
    /// was hit during the current run, 0 otherwise.
    pub fn pcs(&self) -> &[u64] {
        &self.pc_slots
    }

    pub fn num_pcs(&self) -> usize {
        self.pc_values.len()
    }

    pub fn get_pc(&self, idx: usize) -> u64 {
        self.pc_slots[idx]
    }

    /// Prefix-sum array over module PC counts; N+1 entries.
    pub fn module_num(&self) -> &[usize] {
        &self.prefix
    }

    /// True when the canonicalized current output vector has not been seen
    /// in this process. Updates the history.
    pub fn new_output_diff_change(&mut self) -> bool {
        let pattern = canonical_output_pattern(&self.output_diff_vec);
        self.seen_output_patterns.insert(pattern)
    }

    /// True when the pattern of which callbacks produced new features is
    /// itself new. Updates the history.
    pub fn new_trace_diff(&mut self, per_cb_new_features: &[bool]) -> bool {
        self.seen_trace_patterns.insert(per_cb_new_features.to_vec())
    }

    /// PCs observed for the first time since the last drain.
    pub fn drain_new_pcs(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.new_pcs)
    }

    /// All PCs observed since process start, table order.
    pub fn observed_pcs(&self) -> Vec<u64> {
        self.pc_values
            .iter()
            .zip(&self.observed)
            .filter(|(_, &seen)| seen)
            .map(|(&pc, _)| pc)
            .collect()
    }
}

/// AFL-style hit-count bucketing: collapses counter values into eight
/// logarithmic buckets so re-execution counts only matter in coarse steps.
fn counter_bucket(counter: u8) -> u64 {
    match counter {
        0 => unreachable!("bucketing an unhit edge"),
        1 => 0,
        2 => 1,
        3 => 2,
        4..=7 => 3,
        8..=15 => 4,
        16..=31 => 5,
        32..=127 => 6,
        _ => 7,
    }
}

/// Normalizes an output vector: zero stays zero, non-zero return codes are
/// relabeled 1, 2, 3… in order of first occurrence. `[0, 7]` and `[0, 1]`
/// collapse; `[0, 1]` and `[1, 0]` do not.
fn canonical_output_pattern(outputs: &[i32]) -> Vec<i32> {
    let mut labels: Vec<(i32, i32)> = Vec::new();
    let mut pattern = Vec::with_capacity(outputs.len());
    for &value in outputs {
        if value == 0 {
            pattern.push(0);
            continue;
        }
        let label = match labels.iter().find(|(v, _)| *v == value) {
            Some(&(_, label)) => label,
            None => {
                let label = labels.len() as i32 + 1;
                labels.push((value, label));
                label
            }
        };
        pattern.push(label);
    }
    pattern
}
