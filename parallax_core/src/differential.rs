use crate::coverage::CoverageOracle;
use crate::dedup::DedupIndex;
use crate::input::{sha1_digest, Sha1Digest};

/// Decision about the current run's output vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivergenceOutcome {
    /// The callbacks did not genuinely disagree (no mix of zero and
    /// non-zero return codes).
    NoDisagreement,
    /// A genuine disagreement whose coverage fingerprint was seen before.
    Duplicate(Sha1Digest),
    /// A first-time fingerprint; `tag` is the artifact infix built from
    /// the return vector.
    New {
        tag: String,
        fingerprint: Sha1Digest,
    },
}

/// Renders a return vector as the artifact infix: `[0, 1]` → `"0_1_"`.
pub fn outvec_tag(outputs: &[i32]) -> String {
    let mut tag = String::new();
    for code in outputs {
        tag.push_str(&format!("{code}_"));
    }
    tag
}

/// Packs PC slots as little-endian 8-byte words.
pub fn pack_pc_words(pcs: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcs.len() * 8);
    for pc in pcs {
        bytes.extend_from_slice(&pc.to_le_bytes());
    }
    bytes
}

/// The divergence fingerprint input: the concatenated PC regions of every
/// callback that returned non-zero. Two inputs that make the same
/// callbacks fail through the same code paths collapse onto one
/// fingerprint regardless of the input bytes.
pub fn divergence_coverage(oracle: &CoverageOracle) -> Vec<u8> {
    let prefix = oracle.module_num();
    let pcs = oracle.pcs();
    let mut coverage = Vec::new();
    for (module, &code) in oracle.output_diff_vec.iter().enumerate() {
        if code != 0 {
            coverage.extend_from_slice(&pack_pc_words(&pcs[prefix[module]..prefix[module + 1]]));
        }
    }
    coverage
}

/// Classifies the current run: genuine disagreement or not, and if so
/// whether its fingerprint is new. A new fingerprint is recorded in the
/// dedup index as a side effect.
pub fn classify_divergence(oracle: &CoverageOracle, dedup: &mut DedupIndex) -> DivergenceOutcome {
    let has_zero = oracle.output_diff_vec.iter().any(|&code| code == 0);
    let has_nonzero = oracle.output_diff_vec.iter().any(|&code| code != 0);
    if !has_zero || !has_nonzero {
        return DivergenceOutcome::NoDisagreement;
    }
    let fingerprint = sha1_digest(&divergence_coverage(oracle));
    if dedup.note_divergence(fingerprint) {
        DivergenceOutcome::New {
            tag: outvec_tag(&oracle.output_diff_vec),
            fingerprint,
        }
    } else {
        DivergenceOutcome::Duplicate(fingerprint)
    }
}
