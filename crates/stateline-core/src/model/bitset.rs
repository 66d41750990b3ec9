use serde::{Deserialize, Serialize};

/// Small growable bit-set over field indices
///
/// Used for loaded/dirty bitmaps on trackers and for the changed-field diff
/// of incremental L2 writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldBitSet {
    words: Vec<u64>,
}

impl FieldBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bit-set with indices `0..len` all set
    pub fn with_all(len: usize) -> Self {
        let mut set = Self::new();
        for index in 0..len {
            set.insert(index);
        }
        set
    }

    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        let mut set = Self::new();
        for index in indices {
            set.insert(index);
        }
        set
    }

    /// Returns true if the bit was newly set
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !was_set
    }

    pub fn remove(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        match self.words.get_mut(word) {
            Some(w) if *w & (1 << bit) != 0 => {
                *w &= !(1 << bit);
                self.trim();
                true
            }
            _ => false,
        }
    }

    // Trailing zero words are dropped so equal sets compare equal
    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn union_with(&mut self, other: &FieldBitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Set indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, bits)| {
            (0..64).filter_map(move |b| (bits & (1u64 << b) != 0).then_some(w * 64 + b))
        })
    }
}

impl FromIterator<usize> for FieldBitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_indices(iter)
    }
}
