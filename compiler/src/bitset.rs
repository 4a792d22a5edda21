// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! A set of usizes, represented as a bit vector

use std::marker::PhantomData;

/// Converts a value into a bit index
///
/// Implementations should compact the resulting range as much as possible
/// because it is used to index into an array of bits.  Implementations must
/// ensure that `a == b` if and only if
/// `a.into_bit_index() == b.into_bit_index()`.
pub trait IntoBitIndex {
    fn into_bit_index(self) -> usize;
}

impl IntoBitIndex for usize {
    fn into_bit_index(self) -> usize {
        self
    }
}

/// Converts a bit index back into a value
///
/// The implementation must ensure that
/// `x.into_bit_index().from_bit_index() == x` and
/// `X::from_bit_index(i).into_bit_index() == i`.
pub trait FromBitIndex: IntoBitIndex {
    fn from_bit_index(i: usize) -> Self;
}

impl FromBitIndex for usize {
    fn from_bit_index(i: usize) -> Self {
        i
    }
}

/// A set implemented as an array of bits
///
/// Unlike `HashSet` and similar containers which actually store the provided
/// data, `BitSet` only stores an array of bits with one bit per potential set
/// item.  By default, a `BitSet` is a set of `usize` but it can be used to
/// store any type which implements [`IntoBitIndex`].
#[derive(Clone)]
pub struct BitSet<K = usize> {
    words: Vec<u32>,
    phantom: PhantomData<K>,
}

impl<K> BitSet<K> {
    pub fn new() -> BitSet<K> {
        BitSet {
            words: Vec::new(),
            phantom: PhantomData,
        }
    }

    fn reserve_words(&mut self, words: usize) {
        if self.words.len() < words {
            self.words.resize(words, 0);
        }
    }

    pub fn reserve(&mut self, bits: usize) {
        self.reserve_words(bits.div_ceil(32));
    }

    pub fn clear(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| usize::try_from(w.count_ones()).unwrap())
            .sum()
    }

    /// Calculate the union of self and another set, storing the result in
    /// self.  Returns true if the value of self changed.
    pub fn union_with(&mut self, other: &BitSet<K>) -> bool {
        let mut added_bits = false;
        self.reserve_words(other.words.len());
        for (w, ow) in self.words.iter_mut().zip(other.words.iter()) {
            let uw = *w | *ow;
            if uw != *w {
                added_bits = true;
                *w = uw;
            }
        }
        added_bits
    }
}

impl<K: IntoBitIndex> BitSet<K> {
    pub fn contains(&self, key: K) -> bool {
        let idx = key.into_bit_index();
        let w = idx / 32;
        let b = idx % 32;
        if w < self.words.len() {
            self.words[w] & (1_u32 << b) != 0
        } else {
            false
        }
    }

    pub fn insert(&mut self, key: K) -> bool {
        let idx = key.into_bit_index();
        let w = idx / 32;
        let b = idx % 32;
        self.reserve_words(w + 1);
        let exists = self.words[w] & (1_u32 << b) != 0;
        self.words[w] |= 1_u32 << b;
        !exists
    }

    pub fn remove(&mut self, key: K) -> bool {
        let idx = key.into_bit_index();
        let w = idx / 32;
        let b = idx % 32;
        self.reserve_words(w + 1);
        let exists = self.words[w] & (1_u32 << b) != 0;
        self.words[w] &= !(1_u32 << b);
        exists
    }
}

impl<K: FromBitIndex> BitSet<K> {
    pub fn iter(&self) -> impl '_ + Iterator<Item = K> {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..32)
                .filter(move |b| word & (1_u32 << b) != 0)
                .map(move |b| K::from_bit_index(w * 32 + b))
        })
    }
}

impl<K> Default for BitSet<K> {
    fn default() -> BitSet<K> {
        BitSet::new()
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = usize>,
    {
        let mut res = BitSet::new();
        for i in iter {
            res.insert(i);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut s = BitSet::new();
        assert!(s.insert(3));
        assert!(!s.insert(3));
        assert!(s.contains(3));
        assert!(!s.contains(4));
        assert!(s.insert(100));
        assert_eq!(s.count(), 2);
        assert!(s.remove(3));
        assert!(!s.remove(3));
        assert!(!s.is_empty());
        assert!(s.remove(100));
        assert!(s.is_empty());
    }

    #[test]
    fn test_iter_union() {
        let mut a: BitSet = [1, 5].into_iter().collect();
        let b: BitSet = [5, 70].into_iter().collect();
        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        let v: Vec<usize> = a.iter().collect();
        assert_eq!(v, &[1, 5, 70]);
    }
}
