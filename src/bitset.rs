// SPDX-License-Identifier: BSD-3-Clause
//! Dense bit sets over location indices, used as points-to sets.

/// A bit set backed by a vector of `u64` words. Grows on insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    words: Vec<u64>,
    /// Number of set bits (cached for O(1) `len`)
    count: usize,
}

impl BitSet {
    const BITS_PER_WORD: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn word_and_bit(index: usize) -> (usize, usize) {
        (index / Self::BITS_PER_WORD, index % Self::BITS_PER_WORD)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        let (w, b) = Self::word_and_bit(index);
        self.words.get(w).is_some_and(|word| word & (1u64 << b) != 0)
    }

    /// Returns true if the bit was not previously set.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        let (w, b) = Self::word_and_bit(index);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        let mask = 1u64 << b;
        let was_clear = self.words[w] & mask == 0;
        if was_clear {
            self.words[w] |= mask;
            self.count += 1;
        }
        was_clear
    }

    /// In-place union. Returns true if any bit was added.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut added = 0;
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            let new = *theirs & !*mine;
            if new != 0 {
                added += new.count_ones() as usize;
                *mine |= new;
            }
        }
        self.count += added;
        added > 0
    }

    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.words.iter().enumerate().all(|(i, w)| {
            let theirs = other.words.get(i).copied().unwrap_or(0);
            w & !theirs == 0
        })
    }

    pub fn intersects(&self, other: &BitSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Set bits, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * Self::BITS_PER_WORD + bit)
            })
        })
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut s = BitSet::new();
        s.extend(iter);
        s
    }
}

impl Extend<usize> for BitSet {
    fn extend<I: IntoIterator<Item = usize>>(&mut self, iter: I) {
        for i in iter {
            self.insert(i);
        }
    }
}
