#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// A compact bit vector used for no-data masks and run-encoded value positions.
///
/// Bits are stored little-endian within each `u64` word:
/// - bit 0 is the LSB of word 0
/// - bit 63 is the MSB of word 0
///
/// The population count is maintained incrementally so cardinality queries on
/// sparse chunks never rescan the words.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBitVec", into = "RawBitVec")]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

/// Persisted form: words and length only. The popcount is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct RawBitVec {
    words: Vec<u64>,
    len: usize,
}

impl From<RawBitVec> for BitVec {
    fn from(raw: RawBitVec) -> Self {
        BitVec::from_words(raw.words, raw.len)
    }
}

impl From<BitVec> for RawBitVec {
    fn from(bits: BitVec) -> Self {
        RawBitVec {
            words: bits.words,
            len: bits.len,
        }
    }
}

#[inline]
fn words_for(bits: usize) -> usize {
    bits.div_ceil(64)
}

impl BitVec {
    pub fn new() -> Self {
        Self {
            words: Vec::new(),
            len: 0,
            ones: 0,
        }
    }

    pub fn with_len_all_false(bits: usize) -> Self {
        Self {
            words: vec![0u64; words_for(bits)],
            len: bits,
            ones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = self.words[index / 64];
        ((word >> (index % 64)) & 1) == 1
    }

    /// Set bit `index`, growing the vector when `index` is past the end.
    ///
    /// Returns the previous bit.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.len {
            if !value {
                return false;
            }
            self.resize(index + 1);
        }
        let word_idx = index / 64;
        let mask = 1u64 << (index % 64);
        let was_set = (self.words[word_idx] & mask) != 0;

        match (was_set, value) {
            (true, false) => {
                self.words[word_idx] &= !mask;
                self.ones -= 1;
            }
            (false, true) => {
                self.words[word_idx] |= mask;
                self.ones += 1;
            }
            _ => {}
        }
        was_set
    }

    /// Grow or truncate to `bits`. New bits are clear.
    pub fn resize(&mut self, bits: usize) {
        if bits < self.len {
            for index in self.iter_ones().filter(|&i| i >= bits).collect::<Vec<_>>() {
                self.set(index, false);
            }
        }
        self.words.resize(words_for(bits), 0);
        self.len = bits;
    }

    pub fn count_ones(&self) -> usize {
        self.ones
    }

    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    /// Heap bytes held by the word buffer.
    pub fn heap_bytes(&self) -> usize {
        self.words.capacity() * std::mem::size_of::<u64>()
    }

    /// Indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                let mut remaining = word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_idx * 64 + bit)
                })
            })
            .take_while(move |&i| i < self.len)
    }

    /// Copy of `self` with every bit moved `by` positions towards the end.
    pub fn shifted_up(&self, by: usize) -> Self {
        let mut shifted = Self::with_len_all_false(self.len + by);
        for index in self.iter_ones() {
            shifted.set(index + by, true);
        }
        shifted
    }

    /// Reconstruct a [`BitVec`] from a raw word buffer and a bit length.
    ///
    /// Bits past `len` in the last word are ignored and cleared.
    pub fn from_words(mut words: Vec<u64>, len: usize) -> Self {
        words.resize(words_for(len), 0);
        let rem_bits = len % 64;
        if rem_bits != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << rem_bits) - 1;
            }
        }
        let ones = words.iter().map(|w| w.count_ones() as usize).sum();
        Self { words, len, ones }
    }
}

impl Default for BitVec {
    fn default() -> Self {
        Self::new()
    }
}
