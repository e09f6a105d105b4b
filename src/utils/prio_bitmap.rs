//! A 256-entry bitmap supporting O(1) set/clear and O(1) "find the lowest
//! set bit" (used to find the highest-priority ready thread, since
//! priorities are numbered 0 = highest).
//!
//! Priorities in this kernel range over the full span of [`u8`] (0..=255),
//! so unlike a general-purpose bit-array type this one is written directly
//! for that fixed size: four 64-bit words hold the bits themselves, and a
//! fifth word summarizes which of the four words is non-zero. Finding the
//! lowest set bit is then two `trailing_zeros` calls instead of a linear
//! scan over 256 bits.
const WORD_BITS: u32 = 64;
const WORDS: usize = 4;

#[derive(Clone, Copy, Debug)]
pub struct PrioBitmap256 {
    summary: u64,
    words: [u64; WORDS],
}

impl PrioBitmap256 {
    pub const INIT: Self = Self {
        summary: 0,
        words: [0; WORDS],
    };

    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.summary == 0
    }

    pub fn get(&self, i: u8) -> bool {
        let (word, bit) = Self::split(i);
        self.words[word] & (1 << bit) != 0
    }

    pub fn set(&mut self, i: u8) {
        let (word, bit) = Self::split(i);
        self.words[word] |= 1 << bit;
        self.summary |= 1 << word;
    }

    pub fn clear(&mut self, i: u8) {
        let (word, bit) = Self::split(i);
        self.words[word] &= !(1 << bit);
        if self.words[word] == 0 {
            self.summary &= !(1 << word);
        }
    }

    /// The lowest-numbered set bit, i.e. the highest-priority ready thread.
    pub fn find_lowest_set(&self) -> Option<u8> {
        if self.summary == 0 {
            return None;
        }
        let word = self.summary.trailing_zeros() as usize;
        let bit = self.words[word].trailing_zeros();
        Some((word as u32 * WORD_BITS + bit) as u8)
    }

    fn split(i: u8) -> (usize, u32) {
        let i = i as u32;
        ((i / WORD_BITS) as usize, i % WORD_BITS)
    }
}

impl Default for PrioBitmap256 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn empty_has_no_lowest() {
        assert_eq!(PrioBitmap256::new().find_lowest_set(), None);
    }

    #[test]
    fn single_bit_roundtrip() {
        for i in [0u8, 1, 63, 64, 65, 127, 200, 255] {
            let mut bm = PrioBitmap256::new();
            assert!(!bm.get(i));
            bm.set(i);
            assert!(bm.get(i));
            assert_eq!(bm.find_lowest_set(), Some(i));
            bm.clear(i);
            assert!(!bm.get(i));
            assert!(bm.is_empty());
        }
    }

    #[quickcheck_macros::quickcheck]
    fn matches_btreeset_model(ops: Vec<(bool, u8)>) -> bool {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut bm = PrioBitmap256::new();
        let mut reference = BTreeSet::new();
        log::trace!("ops = {ops:?}");
        for (set, i) in ops {
            if set {
                bm.set(i);
                reference.insert(i);
            } else {
                bm.clear(i);
                reference.remove(&i);
            }
            if bm.find_lowest_set() != reference.iter().next().copied() {
                return false;
            }
        }
        true
    }
}
