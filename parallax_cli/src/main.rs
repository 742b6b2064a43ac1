use clap::Parser;
use parallax_core::coverage::{EdgeSink, TargetSet};
use parallax_core::{read_corpus_dir, ByteMutator, FuzzOptions, Fuzzer, Unit};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided differential fuzzer", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults to ./parallax.toml when present.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Directories holding initial corpus files (raw byte units).
    #[clap(value_parser)]
    corpus_dirs: Vec<PathBuf>,
    /// Stop after this many runs.
    #[clap(long)]
    runs: Option<u64>,
    /// Maximum input length in bytes.
    #[clap(long)]
    max_len: Option<usize>,
    /// Stop after this many wall-clock seconds.
    #[clap(long)]
    max_total_time_sec: Option<u64>,
    /// Per-unit timeout in seconds.
    #[clap(long)]
    timeout_sec: Option<u64>,
    /// Resident-set limit in megabytes.
    #[clap(long)]
    rss_limit_mb: Option<usize>,
    /// Directory interesting units are written to.
    #[clap(long)]
    output_corpus: Option<PathBuf>,
    /// Prefix for crash/timeout/oom/diff artifacts.
    #[clap(long)]
    artifact_prefix: Option<String>,
    /// Run all registered callbacks per input and compare their outputs.
    #[clap(long)]
    differential: bool,
    /// PRNG seed; defaults to the current time.
    #[clap(long)]
    seed: Option<u64>,
    /// Restrict generated inputs to printable ASCII.
    #[clap(long)]
    only_ascii: bool,
    /// Print the stat:: block on exit.
    #[clap(long)]
    print_final_stats: bool,
}

/// Reference target: parity of the set-bit count over all input bytes.
fn parity(data: &[u8], sink: &mut EdgeSink<'_>) -> i32 {
    sink.hit(0);
    let mut ones = 0u32;
    for byte in data {
        ones = ones.wrapping_add(byte.count_ones());
    }
    if data.len() > 4 {
        sink.hit(1);
    }
    if ones % 2 == 0 {
        sink.hit(2);
        0
    } else {
        sink.hit(3);
        1
    }
}

/// Buggy variant: bytes equal to 0x7f are not counted, flipping the
/// parity of any input containing an odd number of them.
fn parity_buggy(data: &[u8], sink: &mut EdgeSink<'_>) -> i32 {
    sink.hit(0);
    let mut ones = 0u32;
    for byte in data {
        if *byte == 0x7f {
            sink.hit(1);
            continue;
        }
        ones = ones.wrapping_add(byte.count_ones());
    }
    if ones % 2 == 0 {
        sink.hit(2);
        0
    } else {
        sink.hit(3);
        1
    }
}

fn build_demo_targets() -> TargetSet {
    let mut targets = TargetSet::new();
    targets.register("parity", (0x1000..0x1004).collect(), |data, sink| {
        parity(data, sink)
    });
    targets.register("parity_buggy", (0x2000..0x2004).collect(), |data, sink| {
        parity_buggy(data, sink)
    });
    targets
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut options = match &cli.config_file {
        Some(config_path) => {
            log::info!("loading configuration from {config_path:?}");
            FuzzOptions::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("parallax.toml");
            if default_config_path.exists() {
                log::info!("loading default configuration {default_config_path:?}");
                FuzzOptions::load_from_file(&default_config_path)?
            } else {
                FuzzOptions::default()
            }
        }
    };

    if let Some(runs) = cli.runs {
        options.runs = runs;
    }
    if let Some(max_len) = cli.max_len {
        options.max_len = max_len;
    }
    if let Some(max_total_time_sec) = cli.max_total_time_sec {
        options.max_total_time_sec = max_total_time_sec;
    }
    if let Some(timeout_sec) = cli.timeout_sec {
        options.timeout_sec = timeout_sec;
    }
    if let Some(rss_limit_mb) = cli.rss_limit_mb {
        options.rss_limit_mb = rss_limit_mb;
    }
    if let Some(output_corpus) = cli.output_corpus {
        options.output_corpus = Some(output_corpus);
    }
    if let Some(artifact_prefix) = cli.artifact_prefix {
        options.artifact_prefix = artifact_prefix;
    }
    if cli.differential {
        options.differential_mode = true;
    }
    if cli.only_ascii {
        options.only_ascii = true;
    }
    if cli.print_final_stats {
        options.print_final_stats = true;
    }

    let seed = cli.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    });
    println!("INFO: seed: {seed}");

    let max_len = options.effective_max_len();
    let mut initial_corpus: Vec<Unit> = Vec::new();
    for dir in &cli.corpus_dirs {
        let mut epoch = None;
        initial_corpus.extend(read_corpus_dir(dir, max_len, &mut epoch));
    }
    if initial_corpus.is_empty() {
        log::info!("no seed inputs found, starting from a single zero byte");
        initial_corpus.push(vec![0]);
    }

    let mutator = Box::new(ByteMutator::new(seed, options.only_ascii));
    let mut fuzzer = Fuzzer::new(build_demo_targets(), mutator, options)?;
    fuzzer.run(initial_corpus);
    Ok(())
}
