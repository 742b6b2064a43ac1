use crate::artifact::ArtifactWriter;
use crate::stats::Stats;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Execution state shared between the fuzzing thread, the watchdog thread,
/// and the allocator hooks. The fuzzing thread writes, everyone else reads.
#[derive(Debug)]
pub struct ExecState {
    running: AtomicBool,
    start_ms: AtomicU64,
    origin: Instant,
    current_unit: Mutex<Vec<u8>>,
}

impl Default for ExecState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            start_ms: AtomicU64::new(0),
            origin: Instant::now(),
            current_unit: Mutex::new(Vec::new()),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Called right before the callback is entered. The start time must be
    /// published before the running flag so the watchdog never reads a
    /// stale timestamp on a live run.
    pub fn mark_start(&self) {
        self.start_ms.store(self.now_ms(), Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    /// Called right after the callback returns. Reports the unit's runtime.
    pub fn mark_stop(&self) -> Duration {
        self.running.store(false, Ordering::Release);
        Duration::from_millis(self.now_ms() - self.start_ms.load(Ordering::Acquire))
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// How long the in-flight callback has been running, if one is.
    pub fn running_elapsed(&self) -> Option<Duration> {
        if !self.running() {
            return None;
        }
        Some(Duration::from_millis(
            self.now_ms()
                .saturating_sub(self.start_ms.load(Ordering::Acquire)),
        ))
    }

    /// Mirrors the unit about to be executed, for post-mortem dumps.
    pub fn set_current_unit(&self, data: &[u8]) {
        let mut unit = self.current_unit.lock().unwrap_or_else(|e| e.into_inner());
        unit.clear();
        unit.extend_from_slice(data);
    }

    pub fn snapshot_unit(&self) -> Vec<u8> {
        self.current_unit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Classification of the unrecoverable outcomes. Each maps to an artifact
/// prefix and an exit code; none of them are recovered from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalKind {
    Crash,
    OutOfMemory,
    Timeout,
    Leak,
    Mismatch,
}

impl FatalKind {
    pub fn artifact_prefix(self) -> &'static str {
        match self {
            FatalKind::Crash => "crash-",
            FatalKind::OutOfMemory => "oom-",
            FatalKind::Timeout => "timeout-",
            FatalKind::Leak => "leak-",
            FatalKind::Mismatch => "mismatch-",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            FatalKind::Crash => "deadly signal",
            FatalKind::OutOfMemory => "out-of-memory",
            FatalKind::Timeout => "timeout",
            FatalKind::Leak => "memory leak",
            FatalKind::Mismatch => "equivalence-mismatch",
        }
    }

    pub fn exit_code(self, error_exitcode: i32, timeout_exitcode: i32) -> i32 {
        match self {
            FatalKind::Timeout => timeout_exitcode,
            _ => error_exitcode,
        }
    }
}

/// Terminates immediately, skipping at-exit work. Stdout is flushed first
/// so the artifact and stat lines survive.
pub fn exit_now(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    raw_exit(code)
}

#[cfg(unix)]
fn raw_exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

#[cfg(not(unix))]
fn raw_exit(code: i32) -> ! {
    std::process::exit(code)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs a SIGINT handler that only sets a flag; the fuzzing thread
/// observes it at loop boundaries. Handlers must stay async-signal-safe.
pub fn install_interrupt_handler() {
    #[cfg(unix)]
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_interrupt as extern "C" fn(libc::c_int) as usize as libc::sighandler_t,
        );
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Hooks into an external leak checker (e.g. a sanitizer runtime). All
/// methods are optional in spirit: a missing checker disables leak probing
/// silently.
pub trait LeakChecker: Send {
    fn disable(&mut self);
    fn enable(&mut self);
    /// Runs the expensive check; true means a leak was found.
    fn do_recoverable_leak_check(&mut self) -> bool;
}

pub struct WatchdogConfig {
    pub timeout_sec: u64,
    pub error_exitcode: i32,
    pub timeout_exitcode: i32,
    pub differential_mode: bool,
}

pub struct WatchdogHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns the timeout police. Polls the shared execution state; when one
/// callback has been running for at least `timeout_sec`, dumps the current
/// unit as `timeout-<sha1>`, prints final stats and exits with the
/// configured timeout code.
pub fn spawn_watchdog(
    config: WatchdogConfig,
    exec: Arc<ExecState>,
    stats: Arc<Stats>,
    artifacts: ArtifactWriter,
) -> WatchdogHandle {
    assert!(config.timeout_sec > 0);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name("parallax-watchdog".into())
        .spawn(move || {
            let timeout = Duration::from_secs(config.timeout_sec);
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
                let Some(elapsed) = exec.running_elapsed() else {
                    continue;
                };
                if elapsed < timeout {
                    continue;
                }
                println!(
                    "ALARM: working on the last unit for {} seconds",
                    elapsed.as_secs()
                );
                println!(
                    "       the timeout is set to {} seconds",
                    config.timeout_sec
                );
                let unit = exec.snapshot_unit();
                artifacts.write_with_prefix(&unit, FatalKind::Timeout.artifact_prefix());
                println!(
                    "==ERROR: parallax: {} after {} seconds",
                    FatalKind::Timeout.summary(),
                    elapsed.as_secs()
                );
                stats.print_final(config.differential_mode);
                exit_now(
                    FatalKind::Timeout.exit_code(config.error_exitcode, config.timeout_exitcode),
                );
            }
        })
        .expect("failed to spawn watchdog thread");
    WatchdogHandle {
        stop,
        thread: Some(thread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_state_tracks_running_window() {
        let exec = ExecState::new();
        assert!(!exec.running());
        assert!(exec.running_elapsed().is_none());

        exec.mark_start();
        assert!(exec.running());
        assert!(exec.running_elapsed().is_some());

        let took = exec.mark_stop();
        assert!(!exec.running());
        assert!(took < Duration::from_secs(1));
    }

    #[test]
    fn exec_state_snapshots_current_unit() {
        let exec = ExecState::new();
        exec.set_current_unit(b"unit under test");
        assert_eq!(exec.snapshot_unit(), b"unit under test");
        exec.set_current_unit(b"next");
        assert_eq!(exec.snapshot_unit(), b"next");
    }

    #[test]
    fn fatal_kinds_map_to_configured_exit_codes() {
        for kind in [
            FatalKind::Crash,
            FatalKind::OutOfMemory,
            FatalKind::Leak,
            FatalKind::Mismatch,
        ] {
            assert_eq!(kind.exit_code(77, 70), 77);
        }
        assert_eq!(FatalKind::Timeout.exit_code(77, 70), 70);
        assert_eq!(FatalKind::OutOfMemory.artifact_prefix(), "oom-");
        assert_eq!(FatalKind::Mismatch.artifact_prefix(), "mismatch-");
    }

    #[test]
    fn watchdog_stays_quiet_under_the_limit() {
        let exec = Arc::new(ExecState::new());
        let stats = Arc::new(Stats::new());
        let artifacts = ArtifactWriter::disabled();
        let handle = spawn_watchdog(
            WatchdogConfig {
                timeout_sec: 3600,
                error_exitcode: 77,
                timeout_exitcode: 70,
                differential_mode: false,
            },
            Arc::clone(&exec),
            stats,
            artifacts,
        );
        exec.mark_start();
        std::thread::sleep(Duration::from_millis(50));
        exec.mark_stop();
        drop(handle); // joins without the process having exited
    }
}
