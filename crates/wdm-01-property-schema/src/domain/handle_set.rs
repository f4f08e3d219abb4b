//! # Handle Sets
//!
//! Bitfield-backed sets of property handles. Schemas use them to mark
//! optional, nullable, dictionary and ephemeral properties.

use shared_types::PropertyHandle;
use std::borrow::Cow;

const WORD_BITS: usize = 64;

/// A set of property handles with O(1) membership.
///
/// Bit `i` of the word table marks handle `i`. Static schemas borrow their
/// words; sets built at runtime own them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandleSet {
    words: Cow<'static, [u64]>,
}

impl HandleSet {
    /// The empty set.
    pub const EMPTY: HandleSet = HandleSet {
        words: Cow::Borrowed(&[]),
    };

    /// Wraps a static word table.
    pub const fn from_static(words: &'static [u64]) -> Self {
        Self {
            words: Cow::Borrowed(words),
        }
    }

    /// Creates an empty set.
    pub fn new() -> Self {
        Self::EMPTY
    }

    /// Membership test.
    pub fn contains(&self, handle: PropertyHandle) -> bool {
        let index = handle.index();
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| word & (1u64 << (index % WORD_BITS)) != 0)
    }

    /// Adds a handle. Returns false if it was already present.
    pub fn insert(&mut self, handle: PropertyHandle) -> bool {
        let index = handle.index();
        let words = self.words.to_mut();
        if words.len() <= index / WORD_BITS {
            words.resize(index / WORD_BITS + 1, 0);
        }
        let bit = 1u64 << (index % WORD_BITS);
        let was_present = words[index / WORD_BITS] & bit != 0;
        words[index / WORD_BITS] |= bit;
        !was_present
    }

    /// Removes a handle. Returns true if it was present.
    pub fn remove(&mut self, handle: PropertyHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let index = handle.index();
        self.words.to_mut()[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
        true
    }

    /// Number of handles in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if no handle is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Handles in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PropertyHandle> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| PropertyHandle((word_index * WORD_BITS + bit) as u16))
        })
    }
}

impl FromIterator<PropertyHandle> for HandleSet {
    fn from_iter<I: IntoIterator<Item = PropertyHandle>>(iter: I) -> Self {
        let mut set = HandleSet::new();
        for handle in iter {
            set.insert(handle);
        }
        set
    }
}
