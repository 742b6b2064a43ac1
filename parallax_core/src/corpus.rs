use crate::input::{sha1_digest, sha1_hex, Sha1Digest, Unit};
use rand::Rng;
use rand_core::RngCore;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// An operation required at least one retained unit.
    #[error("corpus is empty, cannot select a unit")]
    Empty,
}

/// A retained input together with its bookkeeping.
///
/// Created when an input either expanded feature coverage or witnessed a
/// new divergence. Mutated only when a strictly smaller equivalent replaces
/// its bytes in place; destroyed only on process exit.
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub unit: Unit,
    pub sha1: Sha1Digest,
    /// Number of feature updates this unit was credited with on admission.
    pub num_features: usize,
    pub num_executed_mutations: usize,
    pub num_successful_mutations: usize,
    /// Sorted feature ids witnessed by this unit, populated when input
    /// reduction is enabled. Divergence-retained units carry an empty set.
    pub feature_set: Vec<u64>,
    pub may_delete_file: bool,
}

/// The live corpus: retained units plus the global feature table.
///
/// The feature table maps every feature ever observed to the size of the
/// smallest unit that produced it. `num_feature_updates` counts every
/// (feature, smaller-size) event and is how callers detect whether an
/// execution produced anything new: snapshot the counter, stream features
/// through [`Corpus::add_feature`], and diff.
#[derive(Default, Debug)]
pub struct Corpus {
    entries: Vec<InputInfo>,
    hashes: HashSet<Sha1Digest>,
    smallest_size_per_feature: HashMap<u64, usize>,
    num_updates: usize,
}

impl Corpus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Inserts a new entry and returns its id.
    ///
    /// The feature table itself is maintained by [`Corpus::add_feature`]
    /// during feature collection; this records only the entry.
    pub fn add_to_corpus(
        &mut self,
        unit: Unit,
        num_features: usize,
        may_delete_file: bool,
        mut feature_set: Vec<u64>,
    ) -> usize {
        feature_set.sort_unstable();
        feature_set.dedup();
        let sha1 = sha1_digest(&unit);
        self.hashes.insert(sha1);
        let id = self.entries.len();
        log::debug!(
            "corpus: added unit {} ({} bytes, {} features)",
            sha1_hex(&sha1),
            unit.len(),
            num_features
        );
        self.entries.push(InputInfo {
            unit,
            sha1,
            num_features,
            num_executed_mutations: 0,
            num_successful_mutations: 0,
            feature_set,
            may_delete_file,
        });
        id
    }

    /// Feature admission rule. Returns true when the observation counted:
    /// the feature was unseen, or (`shrink`) it was produced by a strictly
    /// smaller unit than any before.
    pub fn add_feature(&mut self, feature: u64, size: usize, shrink: bool) -> bool {
        match self.smallest_size_per_feature.get_mut(&feature) {
            None => {
                self.smallest_size_per_feature.insert(feature, size);
                self.num_updates += 1;
                true
            }
            Some(smallest) if shrink && size < *smallest => {
                *smallest = size;
                self.num_updates += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Replaces entry `id` in place when `data` is strictly smaller and
    /// still covers every feature the entry is known for. Statistics are
    /// preserved across the swap.
    pub fn try_replace(&mut self, id: usize, data: &[u8], feature_set: &[u64]) -> bool {
        let entry = &self.entries[id];
        if data.len() >= entry.unit.len() || entry.unit.is_empty() {
            return false;
        }
        if !entry
            .feature_set
            .iter()
            .all(|f| feature_set.binary_search(f).is_ok())
        {
            return false;
        }
        let old_sha1 = entry.sha1;
        let new_sha1 = sha1_digest(data);
        log::debug!(
            "corpus: replaced unit {} ({} bytes) with {} ({} bytes)",
            sha1_hex(&old_sha1),
            entry.unit.len(),
            sha1_hex(&new_sha1),
            data.len()
        );
        let entry = &mut self.entries[id];
        entry.unit = data.to_vec();
        entry.sha1 = new_sha1;
        self.hashes.remove(&old_sha1);
        self.hashes.insert(new_sha1);
        true
    }

    /// Weighted random selection of the next seed.
    ///
    /// Units with fewer successful mutations weigh more (they are less
    /// explored); under `prefer_small`, smaller units get an extra edge.
    pub fn choose_unit_to_mutate(
        &self,
        rng: &mut dyn RngCore,
        prefer_small: bool,
    ) -> Result<usize, CorpusError> {
        if self.entries.is_empty() {
            return Err(CorpusError::Empty);
        }
        let weights: Vec<f64> = self
            .entries
            .iter()
            .map(|entry| {
                let mut weight = (entry.num_features + 1) as f64
                    / (1 + entry.num_successful_mutations) as f64;
                if prefer_small {
                    weight /= 1.0 + (1.0 + entry.unit.len() as f64).ln();
                }
                weight
            })
            .collect();
        let total: f64 = weights.iter().sum();
        let mut point: f64 = rng.random_range(0.0..total);
        for (id, weight) in weights.iter().enumerate() {
            if point < *weight {
                return Ok(id);
            }
            point -= weight;
        }
        Ok(self.entries.len() - 1)
    }

    pub fn entry(&self, id: usize) -> &InputInfo {
        &self.entries[id]
    }

    pub fn entry_mut(&mut self, id: usize) -> &mut InputInfo {
        &mut self.entries[id]
    }

    pub fn entries(&self) -> &[InputInfo] {
        &self.entries
    }

    /// Total number of (feature, smaller-size) events so far.
    pub fn num_feature_updates(&self) -> usize {
        self.num_updates
    }

    /// Number of distinct features observed so far.
    pub fn num_features(&self) -> usize {
        self.smallest_size_per_feature.len()
    }

    pub fn num_active_units(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.unit.len()).sum()
    }

    pub fn max_input_size(&self) -> usize {
        self.entries.iter().map(|e| e.unit.len()).max().unwrap_or(0)
    }

    pub fn has_unit(&self, data: &[u8]) -> bool {
        self.hashes.contains(&sha1_digest(data))
    }

    pub fn has_unit_hash(&self, hex: &str) -> bool {
        self.entries.iter().any(|e| sha1_hex(&e.sha1) == hex)
    }

    /// Smallest recorded size for a feature, if it was ever observed.
    pub fn smallest_size_for_feature(&self, feature: u64) -> Option<usize> {
        self.smallest_size_per_feature.get(&feature).copied()
    }
}
