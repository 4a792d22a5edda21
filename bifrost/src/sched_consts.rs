// Copyright © 2024 Collabora, Ltd.
// SPDX-License-Identifier: MIT

//! Clause constant merging
//!
//! A tuple embeds at most two 32-bit constants.  When a clause is finalized,
//! all of its tuples' constants are packed into a shared table of 64-bit
//! words, subject to the encoding rules:
//!
//! * a two-constant tuple's values must land in the same word;
//! * a PC-relative constant always occupies the high half of its word and
//!   the word is placed first, since the 5- and 8-tuple clause formats have
//!   no selectable modifier for the first word;
//! * each subsequent word carries a 4-bit modifier derived from the low
//!   nibbles of adjacent words, which should be zero where possible.  A word
//!   may be swapped to fix its modifier unless it is the table's final word,
//!   in which case a zero pad word is appended first.
//!
//! The budget shrinks as the clause grows: a clause of N tuples may use at
//! most 13 - N words.

pub const MAX_CONST_WORDS: usize = 13;

/// Words available to a clause holding `tuple_count` tuples plus one more
/// being considered
pub fn const_words_budget(tuple_count: usize) -> usize {
    MAX_CONST_WORDS.saturating_sub(tuple_count + 1)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConstReq {
    pub value: u32,
    pub pcrel: bool,
}

/// The constants requested by a single tuple
#[derive(Clone, Default, Debug)]
pub struct TupleConsts {
    reqs: Vec<ConstReq>,
}

impl TupleConsts {
    pub fn count(&self) -> usize {
        self.reqs.len()
    }

    pub fn reqs(&self) -> &[ConstReq] {
        &self.reqs
    }

    pub fn contains(&self, value: u32, pcrel: bool) -> bool {
        self.reqs.contains(&ConstReq { value, pcrel })
    }

    pub fn can_add(&self, value: u32, pcrel: bool) -> bool {
        self.contains(value, pcrel) || self.reqs.len() < 2
    }

    pub fn add(&mut self, value: u32, pcrel: bool) {
        if !self.contains(value, pcrel) {
            debug_assert!(self.reqs.len() < 2);
            self.reqs.push(ConstReq { value, pcrel });
        }
    }

    /// Words this tuple could add to the clause table, ignoring any
    /// cross-tuple sharing.  Used as a pessimistic bound by the legality
    /// check so that the final merge can never exceed the budget.
    pub fn worst_case_words(&self) -> usize {
        self.reqs.len().div_ceil(2)
    }
}

pub fn worst_case_words(tuples: &[TupleConsts]) -> usize {
    tuples.iter().map(|t| t.worst_case_words()).sum()
}

#[derive(Clone, Copy)]
struct Pair {
    lo: u32,
    hi: u32,
    pcrel: bool,
}

impl Pair {
    fn word(&self) -> u64 {
        u64::from(self.lo) | (u64::from(self.hi) << 32)
    }

    fn swap(&mut self) {
        debug_assert!(!self.pcrel);
        std::mem::swap(&mut self.lo, &mut self.hi);
    }
}

/// The merged constant table of one clause
pub struct ConstTable {
    words: Vec<u64>,
    pcrel_word: Option<usize>,
}

impl ConstTable {
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Resolve a constant to its (word index, high half) location.
    ///
    /// Panics if the constant was never merged; every request accepted by
    /// the legality check must be resolvable here.
    pub fn lookup(&self, value: u32, pcrel: bool) -> (u8, bool) {
        if pcrel {
            let w = self
                .pcrel_word
                .unwrap_or_else(|| panic!("no PC-relative constant word"));
            debug_assert_eq!((self.words[w] >> 32) as u32, value);
            return (w.try_into().unwrap(), true);
        }

        for (i, word) in self.words.iter().enumerate() {
            if *word as u32 == value {
                return (i.try_into().unwrap(), false);
            }
            // The high half of the PC-relative word is patched at link time
            // and cannot back an ordinary constant.
            if (*word >> 32) as u32 == value && Some(i) != self.pcrel_word {
                return (i.try_into().unwrap(), true);
            }
        }
        panic!("constant {value:#010x} missing from clause table");
    }
}

fn pair_has(pairs: &[Pair], value: u32) -> bool {
    pairs
        .iter()
        .any(|p| p.lo == value || (p.hi == value && !p.pcrel))
}

pub fn merge_constants(tuples: &[TupleConsts], num_tuples: usize) -> ConstTable {
    let mut pairs: Vec<Pair> = Vec::new();

    // Two-constant tuples first: their values must share a word, with any
    // PC-relative half high.  Identical pairs are deduplicated, in either
    // orientation, but never against the PC-relative pair.
    for t in tuples.iter().filter(|t| t.count() == 2) {
        let (a, b) = (t.reqs[0], t.reqs[1]);
        debug_assert!(!(a.pcrel && b.pcrel));
        let pair = if a.pcrel {
            Pair {
                lo: b.value,
                hi: a.value,
                pcrel: true,
            }
        } else {
            Pair {
                lo: a.value,
                hi: b.value,
                pcrel: b.pcrel,
            }
        };
        let dup = pairs.iter().any(|p| {
            p.pcrel == pair.pcrel
                && ((p.lo == pair.lo && p.hi == pair.hi)
                    || (!pair.pcrel && p.lo == pair.hi && p.hi == pair.lo))
        });
        if !dup {
            pairs.push(pair);
        }
    }

    // Then singletons: reuse any existing half of matching value, pair the
    // rest off two at a time, and pad the leftover with zero.
    let mut pending: Option<u32> = None;
    for t in tuples.iter().filter(|t| t.count() == 1) {
        let c = t.reqs[0];
        if c.pcrel {
            if let Some(p) = pairs.iter().find(|p| p.pcrel) {
                debug_assert_eq!(p.hi, c.value);
            } else {
                pairs.push(Pair {
                    lo: 0,
                    hi: c.value,
                    pcrel: true,
                });
            }
            continue;
        }
        if pair_has(&pairs, c.value) {
            continue;
        }
        match pending {
            Some(p) if p == c.value => (),
            Some(p) => {
                pairs.push(Pair {
                    lo: p,
                    hi: c.value,
                    pcrel: false,
                });
                pending = None;
            }
            None => pending = Some(c.value),
        }
    }
    if let Some(p) = pending {
        pairs.push(Pair {
            lo: p,
            hi: 0,
            pcrel: false,
        });
    }

    // The PC-relative word goes first
    if let Some(i) = pairs.iter().position(|p| p.pcrel) {
        let p = pairs.remove(i);
        pairs.insert(0, p);
    }

    let nib = |v: u32| (v & 0xf) as u8;

    // The 5- and 8-tuple formats have no modifier field for the first word,
    // so a non-PC-relative first word needs a zero low nibble.
    if matches!(num_tuples, 5 | 8) {
        if let Some(first) = pairs.first_mut() {
            if !first.pcrel && nib(first.lo) != 0 {
                if nib(first.hi) == 0 {
                    first.swap();
                } else {
                    pairs.insert(
                        0,
                        Pair {
                            lo: 0,
                            hi: 0,
                            pcrel: false,
                        },
                    );
                }
            }
        }
    }

    // Modifier sweep: swap words whose low nibble disagrees with the
    // previous word's, when swapping fixes it.  The final word cannot be
    // swapped directly, so it gets a pad appended first.
    let mut k = 1;
    while k < pairs.len() {
        let prev_nib = nib(pairs[k - 1].lo);
        if !pairs[k].pcrel
            && nib(pairs[k].lo) != prev_nib
            && nib(pairs[k].hi) == prev_nib
        {
            if k == pairs.len() - 1 {
                pairs.push(Pair {
                    lo: 0,
                    hi: 0,
                    pcrel: false,
                });
            }
            pairs[k].swap();
        }
        k += 1;
    }

    let pcrel_word = pairs.iter().position(|p| p.pcrel);
    debug_assert!(pcrel_word.is_none() || pcrel_word == Some(0));

    ConstTable {
        words: pairs.iter().map(|p| p.word()).collect(),
        pcrel_word,
    }
}
