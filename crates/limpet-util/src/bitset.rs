// Packed completion bitset. Bit order is MSB-first within each byte,
// matching the on-disk control-file bitfield layout.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid range {first}..={last} (limit {limit})")]
pub struct RangeError {
    pub first: u64,
    pub last: u64,
    pub limit: u64,
}

/// Bit array over completion units with an incrementally maintained
/// set-bit count. Bits are only ever cleared by a full reset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitset {
    bytes: Vec<u8>,
    bits: usize,
    ones: usize,
}

impl Bitset {
    pub fn new(bits: usize) -> Self {
        let bytes = (bits + 7) / 8;
        Self {
            bytes: vec![0; bytes],
            bits,
            ones: 0,
        }
    }

    /// Restores a bitset from its wire bytes. Missing bytes are treated
    /// as zero; bits past `bits` in the final byte are masked off so the
    /// maintained count stays exact.
    pub fn from_bytes(bytes: &[u8], bits: usize) -> Self {
        let expected = (bits + 7) / 8;
        let mut storage = vec![0u8; expected];
        let copy_len = bytes.len().min(expected);
        storage[..copy_len].copy_from_slice(&bytes[..copy_len]);

        let tail_bits = bits % 8;
        if tail_bits > 0 && expected > 0 {
            storage[expected - 1] &= 0xFF << (8 - tail_bits);
        }

        let ones = storage.iter().map(|b| b.count_ones() as usize).sum();
        Self {
            bytes: storage,
            bits,
            ones,
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.bits {
            return false;
        }
        let mask = 1u8 << (7 - (idx % 8));
        (self.bytes[idx / 8] & mask) != 0
    }

    /// Sets one bit. Returns true if the bit was newly set; out-of-range
    /// indices are a no-op.
    pub fn set(&mut self, idx: usize) -> bool {
        if idx >= self.bits {
            return false;
        }
        let byte = idx / 8;
        let mask = 1u8 << (7 - (idx % 8));
        if self.bytes[byte] & mask != 0 {
            return false;
        }
        self.bytes[byte] |= mask;
        self.ones += 1;
        true
    }

    /// Marks units `[first, last]` inclusive as complete. Idempotent.
    /// Returns the number of bits that went from clear to set.
    pub fn set_range(&mut self, first: usize, last: usize) -> Result<usize, RangeError> {
        if first > last || last >= self.bits {
            return Err(RangeError {
                first: first as u64,
                last: last as u64,
                limit: self.bits as u64,
            });
        }

        let first_byte = first / 8;
        let last_byte = last / 8;
        let mut newly = 0usize;

        for byte in first_byte..=last_byte {
            let lo = if byte == first_byte { first % 8 } else { 0 };
            let hi = if byte == last_byte { last % 8 } else { 7 };
            let mask = ((0xFFu16 >> lo) as u8) & (0xFF << (7 - hi));
            newly += (mask & !self.bytes[byte]).count_ones() as usize;
            self.bytes[byte] |= mask;
        }

        self.ones += newly;
        Ok(newly)
    }

    pub fn count_set(&self) -> usize {
        self.ones
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn is_full(&self) -> bool {
        self.ones == self.bits
    }

    /// First clear bit at or after `from`, or None if the rest is set.
    pub fn find_unset(&self, from: usize) -> Option<usize> {
        let mut idx = from;
        while idx < self.bits && idx % 8 != 0 {
            if !self.get(idx) {
                return Some(idx);
            }
            idx += 1;
        }
        while idx < self.bits {
            let byte = self.bytes[idx / 8];
            if byte != 0xFF {
                for bit in 0..8 {
                    let i = idx + bit;
                    if i >= self.bits {
                        return None;
                    }
                    if byte & (1 << (7 - bit)) == 0 {
                        return Some(i);
                    }
                }
            }
            idx += 8;
        }
        None
    }

    /// First set bit at or after `from`, or None if the rest is clear.
    pub fn find_set(&self, from: usize) -> Option<usize> {
        let mut idx = from;
        while idx < self.bits && idx % 8 != 0 {
            if self.get(idx) {
                return Some(idx);
            }
            idx += 1;
        }
        while idx < self.bits {
            let byte = self.bytes[idx / 8];
            if byte != 0x00 {
                for bit in 0..8 {
                    let i = idx + bit;
                    if i >= self.bits {
                        return None;
                    }
                    if byte & (1 << (7 - bit)) != 0 {
                        return Some(i);
                    }
                }
            }
            idx += 8;
        }
        None
    }

    /// Exclusive end of the contiguous set run starting at `from`.
    /// Returns `from` itself when `from` is clear.
    pub fn find_set_end(&self, from: usize) -> usize {
        self.find_unset(from).unwrap_or(self.bits)
    }

    /// Full reset. The only operation that clears bits.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
        self.ones = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_all_clear() {
        let bs = Bitset::new(100);
        assert_eq!(bs.len(), 100);
        assert_eq!(bs.count_set(), 0);
        assert!(!bs.get(0));
        assert!(!bs.get(99));
        assert_eq!(bs.find_unset(0), Some(0));
        assert_eq!(bs.find_set(0), None);
    }

    #[test]
    fn test_set_single_counts_once() {
        let mut bs = Bitset::new(16);
        assert!(bs.set(3));
        assert!(!bs.set(3));
        assert_eq!(bs.count_set(), 1);
        assert!(bs.get(3));
    }

    #[test]
    fn test_set_out_of_range_is_noop() {
        let mut bs = Bitset::new(8);
        assert!(!bs.set(8));
        assert_eq!(bs.count_set(), 0);
    }

    #[test]
    fn test_msb_first_byte_order() {
        let mut bs = Bitset::new(16);
        bs.set(0);
        bs.set(9);
        assert_eq!(bs.as_bytes(), &[0x80, 0x40]);
    }

    #[test]
    fn test_set_range_counts_newly_set() {
        let mut bs = Bitset::new(64);
        assert_eq!(bs.set_range(2, 10).unwrap(), 9);
        assert_eq!(bs.count_set(), 9);
        // idempotent
        assert_eq!(bs.set_range(2, 10).unwrap(), 0);
        // partial overlap
        assert_eq!(bs.set_range(8, 20).unwrap(), 10);
        assert_eq!(bs.count_set(), 19);
    }

    #[test]
    fn test_set_range_whole() {
        let mut bs = Bitset::new(29);
        assert_eq!(bs.set_range(0, 28).unwrap(), 29);
        assert!(bs.is_full());
        assert_eq!(bs.find_unset(0), None);
    }

    #[test]
    fn test_set_range_bounds() {
        let mut bs = Bitset::new(10);
        assert!(bs.set_range(5, 4).is_err());
        assert!(bs.set_range(0, 10).is_err());
        assert_eq!(bs.count_set(), 0);
    }

    #[test]
    fn test_find_unset_skips_full_bytes() {
        let mut bs = Bitset::new(64);
        bs.set_range(0, 40).unwrap();
        assert_eq!(bs.find_unset(0), Some(41));
        assert_eq!(bs.find_unset(41), Some(41));
        assert_eq!(bs.find_unset(63), Some(63));
    }

    #[test]
    fn test_find_set_and_run_end() {
        let mut bs = Bitset::new(32);
        bs.set_range(10, 19).unwrap();
        assert_eq!(bs.find_set(0), Some(10));
        assert_eq!(bs.find_set(15), Some(15));
        assert_eq!(bs.find_set(20), None);
        assert_eq!(bs.find_set_end(10), 20);
        assert_eq!(bs.find_set_end(5), 5);
    }

    #[test]
    fn test_find_set_end_runs_to_len() {
        let mut bs = Bitset::new(12);
        bs.set_range(4, 11).unwrap();
        assert_eq!(bs.find_set_end(4), 12);
    }

    #[test]
    fn test_from_bytes_masks_tail() {
        let bs = Bitset::from_bytes(&[0xFF, 0xFF], 10);
        assert_eq!(bs.count_set(), 10);
        assert!(bs.get(9));
        assert!(!bs.get(10));
        assert!(bs.is_full());
        assert_eq!(bs.find_unset(0), None);
    }

    #[test]
    fn test_from_bytes_short_input() {
        let bs = Bitset::from_bytes(&[0x80], 24);
        assert_eq!(bs.count_set(), 1);
        assert!(bs.get(0));
        assert_eq!(bs.find_unset(0), Some(1));
    }

    #[test]
    fn test_roundtrip_bytes() {
        let mut bs = Bitset::new(20);
        bs.set_range(3, 17).unwrap();
        let restored = Bitset::from_bytes(bs.as_bytes(), 20);
        assert_eq!(restored, bs);
    }

    #[test]
    fn test_clear_resets_count() {
        let mut bs = Bitset::new(40);
        bs.set_range(0, 39).unwrap();
        bs.clear();
        assert_eq!(bs.count_set(), 0);
        assert_eq!(bs.find_set(0), None);
    }
}
