//! Coverage-guided differential fuzzing engine.
//!
//! Feeds synthesized byte inputs to N registered target callbacks, tracks
//! edge/feature coverage per callback, and retains inputs that either
//! expand total coverage or make the callbacks disagree on output.

pub mod artifact;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod dedup;
pub mod differential;
pub mod driver;
pub mod equivalence;
pub mod executor;
pub mod input;
pub mod mutator;
pub mod stats;
pub mod watchdog;

pub use artifact::{read_corpus_dir, ArtifactWriter};
pub use config::{ConfigError, FuzzOptions};
pub use corpus::{Corpus, CorpusError, InputInfo};
pub use coverage::{CoverageOracle, EdgeSink, TargetSet};
pub use dedup::DedupIndex;
pub use differential::DivergenceOutcome;
pub use driver::{DriverError, Fuzzer};
pub use equivalence::EquivalenceChannel;
pub use executor::{AllocTracer, ExecError, Harness};
pub use input::Unit;
pub use mutator::{ByteMutator, Mutator};
pub use stats::Stats;
pub use watchdog::{FatalKind, LeakChecker};
