use crate::input::Sha1Digest;
use std::collections::HashSet;

/// Two content-addressed presence sets backing duplicate suppression.
///
/// `mutation_hashes` holds the digest of every candidate ever submitted to
/// execution; `coverage_hashes` holds one digest per unique divergence
/// fingerprint. The two axes are independent and must not be merged.
#[derive(Default, Debug)]
pub struct DedupIndex {
    mutation_hashes: HashSet<Sha1Digest>,
    coverage_hashes: HashSet<Sha1Digest>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a mutated candidate. Returns false if it was already seen.
    pub fn note_mutation(&mut self, digest: Sha1Digest) -> bool {
        self.mutation_hashes.insert(digest)
    }

    pub fn has_mutation(&self, digest: &Sha1Digest) -> bool {
        self.mutation_hashes.contains(digest)
    }

    /// Registers a divergence fingerprint. Returns false for a duplicate.
    pub fn note_divergence(&mut self, digest: Sha1Digest) -> bool {
        self.coverage_hashes.insert(digest)
    }

    pub fn num_mutations(&self) -> usize {
        self.mutation_hashes.len()
    }

    pub fn num_divergences(&self) -> usize {
        self.coverage_hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::sha1_digest;

    #[test]
    fn mutation_hashes_deduplicate() {
        let mut index = DedupIndex::new();
        let digest = sha1_digest(b"unit");
        assert!(index.note_mutation(digest));
        assert!(!index.note_mutation(digest));
        assert!(index.has_mutation(&digest));
        assert_eq!(index.num_mutations(), 1);
    }

    #[test]
    fn divergence_axis_is_independent() {
        let mut index = DedupIndex::new();
        let digest = sha1_digest(b"fingerprint");
        assert!(index.note_mutation(digest));
        // The same digest is still new on the divergence axis.
        assert!(index.note_divergence(digest));
        assert!(!index.note_divergence(digest));
        assert_eq!(index.num_divergences(), 1);
    }
}
