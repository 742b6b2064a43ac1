use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Applied when `max-len` is left at 0.
pub const DEFAULT_MAX_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// The option surface consumed by the fuzzing core.
///
/// Every field has a default, so an empty TOML document (or no config file
/// at all) yields a usable configuration. The CLI layer applies per-flag
/// overrides on top of whatever was loaded.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzOptions {
    /// Maximum input length in bytes. 0 selects [`DEFAULT_MAX_LEN`].
    #[serde(default)]
    pub max_len: usize,
    /// Stop after this many runs. 0 means unlimited.
    #[serde(default)]
    pub runs: u64,
    /// Stop after this many wall-clock seconds. 0 means unlimited.
    #[serde(default)]
    pub max_total_time_sec: u64,
    /// A single callback execution taking longer than this is a timeout.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Resident-set limit in megabytes. 0 disables the check.
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: usize,
    /// Directory interesting units are written to, and re-read from.
    pub output_corpus: Option<PathBuf>,
    /// How often to re-scan the output corpus for units added externally.
    #[serde(default = "default_reload_interval_sec")]
    pub reload_interval_sec: u64,
    #[serde(default = "default_verbosity")]
    pub verbosity: u32,
    #[serde(default = "default_true")]
    pub detect_leaks: bool,
    #[serde(default = "default_true")]
    pub use_counters: bool,
    #[serde(default)]
    pub use_value_profile: bool,
    #[serde(default)]
    pub print_new_cov_pcs: bool,
    /// Run every registered callback per input and look for disagreement.
    #[serde(default)]
    pub differential_mode: bool,
    #[serde(default = "default_true")]
    pub shuffle_at_startup: bool,
    #[serde(default = "default_true")]
    pub prefer_small: bool,
    /// Consecutive mutations applied to one seed per iteration.
    #[serde(default = "default_mutate_depth")]
    pub mutate_depth: usize,
    /// Allow a smaller unit to take over a feature's smallest-size record.
    #[serde(default)]
    pub shrink: bool,
    /// Track per-entry feature sets so entries can be replaced in place.
    #[serde(default)]
    pub reduce_inputs: bool,
    #[serde(default)]
    pub experimental_len_control: bool,
    #[serde(default)]
    pub only_ascii: bool,
    #[serde(default = "default_true")]
    pub save_artifacts: bool,
    #[serde(default)]
    pub artifact_prefix: String,
    /// Overrides the prefix-derived artifact path entirely when set.
    pub exact_artifact_path: Option<PathBuf>,
    /// Exit with 0 once a PC whose hex rendering contains this string is hit.
    pub exit_on_src_pos: Option<String>,
    /// Exit with 0 once the corpus holds a unit with this hex SHA-1.
    pub exit_on_item: Option<String>,
    #[serde(default)]
    pub print_coverage: bool,
    #[serde(default)]
    pub dump_coverage: bool,
    #[serde(default)]
    pub print_final_stats: bool,
    #[serde(default)]
    pub print_corpus_stats: bool,
    #[serde(default = "default_true")]
    pub print_new: bool,
    /// Report units slower than this many seconds. 0 disables.
    #[serde(default = "default_report_slow_units")]
    pub report_slow_units: u64,
    /// 0 = off, 1 = count, 2 = count and trace each allocation.
    #[serde(default)]
    pub trace_malloc: u8,
    #[serde(default = "default_error_exitcode")]
    pub error_exitcode: i32,
    #[serde(default = "default_timeout_exitcode")]
    pub timeout_exitcode: i32,
    #[serde(default = "default_true")]
    pub do_cross_over: bool,
    /// Progress log destination (TSV appended every 20 runs).
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_timeout_sec() -> u64 {
    1200
}
fn default_rss_limit_mb() -> usize {
    2048
}
fn default_reload_interval_sec() -> u64 {
    1
}
fn default_verbosity() -> u32 {
    1
}
fn default_mutate_depth() -> usize {
    5
}
fn default_report_slow_units() -> u64 {
    10
}
fn default_error_exitcode() -> i32 {
    77
}
fn default_timeout_exitcode() -> i32 {
    70
}
fn default_log_path() -> PathBuf {
    PathBuf::from("./log")
}
fn default_true() -> bool {
    true
}

impl Default for FuzzOptions {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl FuzzOptions {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Max input length with the 0-means-default rule applied.
    pub fn effective_max_len(&self) -> usize {
        if self.max_len == 0 {
            DEFAULT_MAX_LEN
        } else {
            self.max_len
        }
    }

    /// Runs bound with the 0-means-unlimited rule applied.
    pub fn effective_max_runs(&self) -> u64 {
        if self.runs == 0 {
            u64::MAX
        } else {
            self.runs
        }
    }
}
