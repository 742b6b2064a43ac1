use crate::coverage::{CoverageOracle, TargetSet};
use crate::equivalence::EquivalenceChannel;
use crate::watchdog::ExecState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    /// The callback observably modified its input buffer.
    #[error("fuzz target overwrote its const input")]
    InputOverwritten,
    /// The callback panicked; the payload message is preserved.
    #[error("fuzz target panicked: {0}")]
    TargetPanic(String),
}

/// Malloc/free parity tracer.
///
/// Leak detection is expensive, so the driver first checks whether a run
/// made more mallocs than frees and only then escalates to the real leak
/// check. The counters are atomics because allocator hooks may run on any
/// thread; start/stop ownership stays with the harness thread.
#[derive(Default)]
pub struct AllocTracer {
    mallocs: AtomicUsize,
    frees: AtomicUsize,
    trace_level: AtomicU8,
    malloc_limit_mb: AtomicUsize,
    oom_hook: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

impl AllocTracer {
    pub fn new() -> Self {
        Default::default()
    }

    /// A single allocation of at least this many megabytes triggers the
    /// OOM hook synchronously. 0 disables the check.
    pub fn set_malloc_limit_mb(&self, limit_mb: usize) {
        self.malloc_limit_mb.store(limit_mb, Ordering::Relaxed);
    }

    /// Installs the hook invoked from `note_malloc` on an over-limit
    /// allocation. The hook must not call back into the driver under lock.
    pub fn set_oom_hook(&self, hook: Box<dyn Fn(usize) + Send + Sync>) {
        *self.oom_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Allocator hook: a target (or allocator shim) reports one allocation.
    pub fn note_malloc(&self, size: usize) {
        let n = self.mallocs.fetch_add(1, Ordering::Relaxed);
        if self.trace_level.load(Ordering::Relaxed) >= 2 {
            log::trace!("MALLOC[{n}] {size}");
        }
        let limit = self.malloc_limit_mb.load(Ordering::Relaxed);
        if limit != 0 && (size >> 20) >= limit {
            let hook = self.oom_hook.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hook) = hook.as_ref() {
                hook(size);
            }
        }
    }

    /// Allocator hook: one deallocation.
    pub fn note_free(&self) {
        let n = self.frees.fetch_add(1, Ordering::Relaxed);
        if self.trace_level.load(Ordering::Relaxed) >= 2 {
            log::trace!("FREE[{n}]");
        }
    }

    fn start(&self, trace_level: u8) {
        self.trace_level.store(trace_level, Ordering::Relaxed);
        if trace_level > 0 {
            log::trace!("MallocFreeTracer: START");
        }
        self.mallocs.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
    }

    /// Returns true if the window saw more mallocs than frees.
    fn stop(&self) -> bool {
        let mallocs = self.mallocs.load(Ordering::Relaxed);
        let frees = self.frees.load(Ordering::Relaxed);
        if self.trace_level.load(Ordering::Relaxed) > 0 {
            log::trace!(
                "MallocFreeTracer: STOP {mallocs} {frees} ({})",
                if mallocs == frees { "same" } else { "DIFFERENT" }
            );
        }
        self.mallocs.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.trace_level.store(0, Ordering::Relaxed);
        mallocs > frees
    }
}

/// Sampled input equality: full compare up to 64 bytes, first and last 32
/// beyond that.
pub fn loose_memeq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let size = a.len();
    if size <= 64 {
        return a == b;
    }
    a[..32] == b[..32] && a[size - 32..] == b[size - 32..]
}

/// Runs one callback once and polices the execution.
pub struct Harness {
    alloc_tracer: Arc<AllocTracer>,
    exec_state: Arc<ExecState>,
    trace_malloc: u8,
    /// Whether the last execution allocated more than it freed.
    pub has_more_mallocs_than_frees: bool,
    /// Wall time of the last execution.
    pub last_unit_time: Duration,
}

impl Harness {
    pub fn new(alloc_tracer: Arc<AllocTracer>, exec_state: Arc<ExecState>, trace_malloc: u8) -> Self {
        Self {
            alloc_tracer,
            exec_state,
            trace_malloc,
            has_more_mallocs_than_frees: false,
            last_unit_time: Duration::ZERO,
        }
    }

    pub fn alloc_tracer(&self) -> &Arc<AllocTracer> {
        &self.alloc_tracer
    }

    /// Executes callback `module` on `data` and returns its return code.
    ///
    /// The callback receives a fresh heap copy so that overreads and
    /// overwrites land in heap memory that instrumentation can police, and
    /// so the original bytes stay pristine for the preservation check
    /// afterwards. The copy is compared back against the original with
    /// [`loose_memeq`]; a mismatch is unrecoverable.
    pub fn execute_callback(
        &mut self,
        targets: &mut TargetSet,
        module: usize,
        data: &[u8],
        oracle: &mut CoverageOracle,
        mut channel: Option<&mut (dyn EquivalenceChannel + 'static)>,
    ) -> Result<i32, ExecError> {
        if let Some(channel) = channel.as_deref_mut() {
            if channel.is_client() {
                channel.write_bytes(data);
            }
        }
        let mut data_copy = data.to_vec();
        self.exec_state.set_current_unit(data);
        self.alloc_tracer.start(self.trace_malloc);
        oracle.reset_maps();
        self.exec_state.mark_start();
        let result = {
            let mut sink = oracle.edge_sink(module);
            let callback = targets.callback_mut(module);
            catch_unwind(AssertUnwindSafe(|| callback(&mut data_copy, &mut sink)))
        };
        self.last_unit_time = self.exec_state.mark_stop();
        self.has_more_mallocs_than_frees = self.alloc_tracer.stop();
        let code =
            result.map_err(|payload| ExecError::TargetPanic(panic_message(payload.as_ref())))?;
        if !loose_memeq(&data_copy, data) {
            return Err(ExecError::InputOverwritten);
        }
        Ok(code)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageOracle;

    fn harness() -> Harness {
        Harness::new(Arc::new(AllocTracer::new()), Arc::new(ExecState::new()), 0)
    }

    #[test]
    fn loose_memeq_is_exact_up_to_64_bytes() {
        let a = vec![7u8; 64];
        let mut b = a.clone();
        assert!(loose_memeq(&a, &b));
        b[33] = 0;
        assert!(!loose_memeq(&a, &b));
    }

    #[test]
    fn loose_memeq_samples_head_and_tail_beyond_64() {
        let a = vec![7u8; 100];
        let mut b = a.clone();
        assert!(loose_memeq(&a, &b));
        // A middle byte is outside the sampled window.
        b[50] = 0;
        assert!(loose_memeq(&a, &b));
        b[0] = 0;
        assert!(!loose_memeq(&a, &b));
        let mut c = a.clone();
        c[99] = 0;
        assert!(!loose_memeq(&a, &c));
    }

    #[test]
    fn callback_return_code_and_coverage_are_captured() {
        let mut targets = TargetSet::new();
        targets.register("ret42", vec![0x10, 0x11], |data, sink| {
            sink.hit(0);
            if !data.is_empty() {
                sink.hit(1);
            }
            42
        });
        let mut oracle = CoverageOracle::new(&targets, true, false);
        let mut harness = harness();
        let code = harness
            .execute_callback(&mut targets, 0, b"x", &mut oracle, None)
            .unwrap();
        assert_eq!(code, 42);
        assert_eq!(oracle.total_pc_coverage(), 2);
    }

    #[test]
    fn overwritten_input_is_detected() {
        let mut targets = TargetSet::new();
        targets.register("scribbler", vec![0x10], |data, _| {
            if !data.is_empty() {
                data[0] ^= 0xff;
            }
            0
        });
        let mut oracle = CoverageOracle::new(&targets, true, false);
        let mut harness = harness();
        let result = harness.execute_callback(&mut targets, 0, b"abc", &mut oracle, None);
        assert!(matches!(result, Err(ExecError::InputOverwritten)));
    }

    #[test]
    fn original_input_survives_callback_scribbling() {
        let mut targets = TargetSet::new();
        targets.register("scribbler", vec![0x10], |data, _| {
            data.fill(0);
            0
        });
        let mut oracle = CoverageOracle::new(&targets, true, false);
        let mut harness = harness();
        let input = b"do not touch".to_vec();
        let _ = harness.execute_callback(&mut targets, 0, &input, &mut oracle, None);
        assert_eq!(input, b"do not touch".to_vec());
    }

    #[test]
    fn target_panic_is_reported_with_message() {
        let mut targets = TargetSet::new();
        targets.register("bomb", vec![0x10], |data, _| {
            if data.first() == Some(&0xff) {
                panic!("boom at byte 0");
            }
            0
        });
        let mut oracle = CoverageOracle::new(&targets, true, false);
        let mut harness = harness();
        match harness.execute_callback(&mut targets, 0, &[0xff], &mut oracle, None) {
            Err(ExecError::TargetPanic(message)) => assert!(message.contains("boom")),
            other => panic!("expected TargetPanic, got {other:?}"),
        }
    }

    #[test]
    fn alloc_parity_is_observed_per_run() {
        let tracer = Arc::new(AllocTracer::new());
        let tracer_for_target = Arc::clone(&tracer);
        let mut targets = TargetSet::new();
        targets.register("leaky", vec![0x10], move |_, _| {
            tracer_for_target.note_malloc(16);
            tracer_for_target.note_malloc(16);
            tracer_for_target.note_free();
            0
        });
        let mut oracle = CoverageOracle::new(&targets, true, false);
        let mut harness = Harness::new(tracer, Arc::new(ExecState::new()), 0);
        harness
            .execute_callback(&mut targets, 0, b"x", &mut oracle, None)
            .unwrap();
        assert!(harness.has_more_mallocs_than_frees);
    }

    #[test]
    fn oversized_single_allocation_fires_oom_hook() {
        let tracer = AllocTracer::new();
        tracer.set_malloc_limit_mb(64);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        tracer.set_oom_hook(Box::new(move |size| {
            fired_clone.store(size, Ordering::SeqCst);
        }));
        tracer.note_malloc(1 << 20);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracer.note_malloc(128 << 20);
        assert_eq!(fired.load(Ordering::SeqCst), 128 << 20);
    }
}
