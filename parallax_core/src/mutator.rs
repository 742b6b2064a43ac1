use crate::corpus::Corpus;
use crate::input::to_ascii;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

/// The mutation engine contract consumed by the driver.
///
/// The engine owns its PRNG; the driver borrows it for corpus selection and
/// shuffling so the whole session replays from one seed. Cross-over needs
/// corpus access, which is passed per call as a non-owning reference rather
/// than stored — the engine and the corpus are constructed independently.
pub trait Mutator {
    /// Begins recording the ops applied to the current candidate.
    fn start_mutation_sequence(&mut self);

    /// Mutates `unit` in place and returns the new size. The result is
    /// non-empty and at most `max_size` bytes.
    fn mutate(&mut self, unit: &mut Vec<u8>, max_size: usize, corpus: Option<&Corpus>) -> usize;

    /// The entry point handed to custom mutators layered on top of this
    /// engine; plain mutation without corpus cross-over.
    fn default_mutate(&mut self, unit: &mut Vec<u8>, max_size: usize) -> usize {
        self.mutate(unit, max_size, None)
    }

    /// Marks the recorded sequence as having produced an interesting unit.
    fn record_successful_mutation_sequence(&mut self);

    /// Logs the recorded sequence.
    fn print_mutation_sequence(&self);

    fn rng(&mut self) -> &mut dyn RngCore;
}

/// Default byte-oriented engine: a small havoc set over raw bytes.
pub struct ByteMutator {
    rng: ChaCha8Rng,
    only_ascii: bool,
    current_sequence: Vec<&'static str>,
    num_successful_sequences: usize,
}

impl ByteMutator {
    pub fn new(seed: u64, only_ascii: bool) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            only_ascii,
            current_sequence: Vec::new(),
            num_successful_sequences: 0,
        }
    }

    fn erase_bytes(&mut self, unit: &mut Vec<u8>) -> Option<&'static str> {
        if unit.len() < 2 {
            return None;
        }
        let len = self.rng.random_range(1..unit.len());
        let start = self.rng.random_range(0..=unit.len() - len);
        unit.drain(start..start + len);
        Some("EraseBytes")
    }

    fn insert_byte(&mut self, unit: &mut Vec<u8>, max_size: usize) -> Option<&'static str> {
        if unit.len() >= max_size {
            return None;
        }
        let pos = self.rng.random_range(0..=unit.len());
        let byte = self.rng.random::<u8>();
        unit.insert(pos, byte);
        Some("InsertByte")
    }

    fn change_byte(&mut self, unit: &mut [u8]) -> Option<&'static str> {
        let pos = self.rng.random_range(0..unit.len());
        unit[pos] = self.rng.random::<u8>();
        Some("ChangeByte")
    }

    fn change_bit(&mut self, unit: &mut [u8]) -> Option<&'static str> {
        let pos = self.rng.random_range(0..unit.len());
        let bit = self.rng.random_range(0..8u8);
        unit[pos] ^= 1 << bit;
        Some("ChangeBit")
    }

    fn copy_part(&mut self, unit: &mut [u8]) -> Option<&'static str> {
        if unit.len() < 2 {
            return None;
        }
        let len = self.rng.random_range(1..unit.len());
        let from = self.rng.random_range(0..=unit.len() - len);
        let to = self.rng.random_range(0..=unit.len() - len);
        unit.copy_within(from..from + len, to);
        Some("CopyPart")
    }

    fn shuffle_bytes(&mut self, unit: &mut [u8]) -> Option<&'static str> {
        if unit.len() < 2 {
            return None;
        }
        let len = self.rng.random_range(2..=unit.len().min(8));
        let start = self.rng.random_range(0..=unit.len() - len);
        for i in (1..len).rev() {
            let j = self.rng.random_range(0..=i);
            unit.swap(start + i, start + j);
        }
        Some("ShuffleBytes")
    }

    /// Splices a random prefix of this unit with a random suffix of a
    /// random corpus unit.
    fn cross_over(
        &mut self,
        unit: &mut Vec<u8>,
        max_size: usize,
        corpus: &Corpus,
    ) -> Option<&'static str> {
        if corpus.is_empty() {
            return None;
        }
        let other_id = self.rng.random_range(0..corpus.num_active_units());
        let other = &corpus.entry(other_id).unit;
        if other.is_empty() {
            return None;
        }
        let keep = self.rng.random_range(0..=unit.len());
        let take = self.rng.random_range(1..=other.len());
        unit.truncate(keep);
        unit.extend_from_slice(&other[other.len() - take..]);
        unit.truncate(max_size);
        Some("CrossOver")
    }
}

impl Mutator for ByteMutator {
    fn start_mutation_sequence(&mut self) {
        self.current_sequence.clear();
    }

    fn mutate(&mut self, unit: &mut Vec<u8>, max_size: usize, corpus: Option<&Corpus>) -> usize {
        debug_assert!(max_size > 0);
        if unit.is_empty() {
            unit.push(0);
        }
        let num_ops = if corpus.is_some() { 7 } else { 6 };
        for _ in 0..8 {
            let applied = match self.rng.random_range(0..num_ops) {
                0 => self.erase_bytes(unit),
                1 => self.insert_byte(unit, max_size),
                2 => self.change_byte(unit),
                3 => self.change_bit(unit),
                4 => self.copy_part(unit),
                5 => self.shuffle_bytes(unit),
                _ => self.cross_over(unit, max_size, corpus.unwrap()),
            };
            if let Some(name) = applied {
                self.current_sequence.push(name);
                break;
            }
        }
        if unit.len() > max_size {
            unit.truncate(max_size);
        }
        if unit.is_empty() {
            unit.push(0);
        }
        if self.only_ascii {
            to_ascii(unit);
        }
        unit.len()
    }

    fn record_successful_mutation_sequence(&mut self) {
        self.num_successful_sequences += 1;
        log::debug!(
            "successful mutation sequence #{}: {}",
            self.num_successful_sequences,
            self.current_sequence.join("-")
        );
    }

    fn print_mutation_sequence(&self) {
        log::info!("MS: {}", self.current_sequence.join("-"));
    }

    fn rng(&mut self) -> &mut dyn RngCore {
        &mut self.rng
    }
}
