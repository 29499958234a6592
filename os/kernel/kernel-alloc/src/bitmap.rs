//! # Order Bitmaps
//!
//! A fixed-length bit array over heap-allocated `u64` words. Bit `i` lives in
//! word `i / 64` at position `i % 64`. Bits past `len` in the last word are
//! never set.

/// Bits per storage word.
pub const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length bit array.
pub struct Bitmap {
    words: &'static mut [u64],
    len: usize,
}

impl Bitmap {
    /// Number of words needed for `bits` bits.
    #[inline]
    #[must_use]
    pub const fn words_for(bits: usize) -> usize {
        bits.div_ceil(WORD_BITS)
    }

    /// Wrap zeroed storage.
    ///
    /// ### Debug assertions
    /// - `words` holds at least `len` bits.
    #[must_use]
    pub fn new(words: &'static mut [u64], len: usize) -> Self {
        debug_assert!(words.len() >= Self::words_for(len));
        Self { words, len }
    }

    /// Number of bits.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw words, low bit first.
    #[inline]
    #[must_use]
    pub fn words(&self) -> &[u64] {
        self.words
    }

    /// Give back the storage.
    #[inline]
    #[must_use]
    pub fn into_words(self) -> &'static mut [u64] {
        self.words
    }

    #[inline]
    #[must_use]
    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] & (1 << (i % WORD_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] |= 1 << (i % WORD_BITS);
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] &= !(1 << (i % WORD_BITS));
    }

    /// Set bits `[start, start + count)`.
    pub fn set_range(&mut self, start: usize, count: usize) {
        self.for_each_mask(start, count, |w, m| *w |= m);
    }

    /// Clear bits `[start, start + count)`.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        self.for_each_mask(start, count, |w, m| *w &= !m);
    }

    /// Whether any bit in `[start, start + count)` is set.
    #[must_use]
    pub fn any_in(&self, start: usize, count: usize) -> bool {
        debug_assert!(start + count <= self.len);
        let mut i = start;
        let end = start + count;
        while i < end {
            let (word, mask, next) = Self::mask_at(i, end);
            if self.words[word] & mask != 0 {
                return true;
            }
            i = next;
        }
        false
    }

    /// Index of the first clear bit at or after `from`.
    #[must_use]
    pub fn first_clear(&self, from: usize) -> Option<usize> {
        let mut i = from;
        while i < self.len {
            let word = i / WORD_BITS;
            let shift = i % WORD_BITS;
            let inverted = !self.words[word] >> shift;
            if inverted != 0 {
                let found = i + inverted.trailing_zeros() as usize;
                return (found < self.len).then_some(found);
            }
            i = (word + 1) * WORD_BITS;
        }
        None
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// The word holding bit `i` and the mask of bits `i..min(end, word end)`,
    /// plus the first bit of the following word.
    #[inline]
    const fn mask_at(i: usize, end: usize) -> (usize, u64, usize) {
        let word = i / WORD_BITS;
        let lo = i % WORD_BITS;
        let word_end = (word + 1) * WORD_BITS;
        let hi = if end < word_end { end % WORD_BITS } else { WORD_BITS };
        let width = hi - lo;
        let mask = if width == WORD_BITS {
            u64::MAX
        } else {
            ((1u64 << width) - 1) << lo
        };
        (word, mask, word_end)
    }

    fn for_each_mask(&mut self, start: usize, count: usize, mut f: impl FnMut(&mut u64, u64)) {
        debug_assert!(start + count <= self.len);
        let mut i = start;
        let end = start + count;
        while i < end {
            let (word, mask, next) = Self::mask_at(i, end);
            f(&mut self.words[word], mask);
            i = next;
        }
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(len: usize) -> Bitmap {
        let words = vec![0u64; Bitmap::words_for(len)].leak();
        Bitmap::new(words, len)
    }

    #[test]
    fn ranges_cross_word_boundaries() {
        let mut bm = bitmap(200);
        bm.set_range(60, 80);
        assert_eq!(bm.count_ones(), 80);
        assert!(!bm.test(59));
        assert!(bm.test(60) && bm.test(139));
        assert!(!bm.test(140));
        assert!(bm.any_in(0, 61));
        assert!(!bm.any_in(140, 60));

        bm.clear_range(64, 64);
        assert_eq!(bm.count_ones(), 16);
        assert!(!bm.any_in(64, 64));
    }

    #[test]
    fn first_clear_skips_full_words() {
        let mut bm = bitmap(130);
        bm.set_range(0, 129);
        assert_eq!(bm.first_clear(0), Some(129));
        bm.set(129);
        assert_eq!(bm.first_clear(0), None);
        bm.clear(65);
        assert_eq!(bm.first_clear(0), Some(65));
        assert_eq!(bm.first_clear(66), None);
    }

    #[test]
    fn first_clear_ignores_bits_past_len() {
        let mut bm = bitmap(3);
        bm.set_range(0, 3);
        assert_eq!(bm.first_clear(0), None);
    }

    #[test]
    fn full_word_mask() {
        let mut bm = bitmap(128);
        bm.set_range(64, 64);
        assert_eq!(bm.words(), &[0, u64::MAX]);
    }
}
