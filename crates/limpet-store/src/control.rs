use limpet_util::bitset::{Bitset, RangeError};
use thiserror::Error;
use tracing::trace;

use crate::piece::{Piece, PieceTable};

pub const CONTROL_VERSION: u16 = 1;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("duplicate piece index {0}")]
    DuplicatePiece(u32),
    #[error("control file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("control file format: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Resume-tracking state for one download.
///
/// The global bitfield holds one bit per piece (or one bit per byte when
/// `piece_length` is zero and piece tracking is unused). Partially
/// written pieces carry a byte-granular sub-bitset in the piece table;
/// once saturated they are promoted into the global bitfield and their
/// table entry dropped.
///
/// Not internally synchronized: one logical caller at a time, fill/lack
/// pairs must not interleave.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlState {
    pub(crate) version: u16,
    pub(crate) ext_flags: u32,
    pub(crate) identity: Vec<u8>,
    pub(crate) piece_length: u32,
    pub(crate) total_length: u64,
    pub(crate) uploaded_length: u64,
    pub(crate) bitfield: Bitset,
    pub(crate) pieces: PieceTable,
}

pub(crate) fn unit_count(piece_length: u32, total_length: u64) -> usize {
    if piece_length == 0 {
        total_length as usize
    } else {
        ((total_length + piece_length as u64 - 1) / piece_length as u64) as usize
    }
}

/// Length of piece `index` out of `count`; only the final piece may be
/// short. Callers guarantee `piece_length > 0` and `index < count`.
pub(crate) fn piece_len(piece_length: u32, total_length: u64, index: u32, count: u32) -> u32 {
    if index < count - 1 {
        return piece_length;
    }
    let remainder = total_length % piece_length as u64;
    if remainder == 0 {
        piece_length
    } else {
        remainder as u32
    }
}

impl ControlState {
    pub fn new(identity: Vec<u8>, piece_length: u32, total_length: u64) -> Self {
        let units = unit_count(piece_length, total_length);
        ControlState {
            version: CONTROL_VERSION,
            ext_flags: 0,
            identity,
            piece_length,
            total_length,
            uploaded_length: 0,
            bitfield: Bitset::new(units),
            pieces: PieceTable::new(),
        }
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn ext_flags(&self) -> u32 {
        self.ext_flags
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded_length
    }

    /// Upload accounting only; has no effect on completion state.
    pub fn add_uploaded(&mut self, bytes: u64) {
        self.uploaded_length = self.uploaded_length.saturating_add(bytes);
    }

    pub fn piece_count(&self) -> u32 {
        if self.piece_length == 0 {
            0
        } else {
            unit_count(self.piece_length, self.total_length) as u32
        }
    }

    /// Length of piece `index`; the final piece may be short.
    pub fn piece_len_at(&self, index: u32) -> u32 {
        let count = self.piece_count();
        if count == 0 {
            return 0;
        }
        piece_len(self.piece_length, self.total_length, index, count)
    }

    /// Next contiguous byte range not yet known complete, at or after
    /// `from`, as a half-open `(beg, end)`. A gap starting inside a
    /// partially tracked piece is clipped at that piece's boundary so
    /// two callers never get overlapping work; a gap over wholly missing
    /// pieces runs across all consecutive wholly missing pieces.
    /// None means nothing is missing from `from` onward.
    pub fn lack(&self, from: u64) -> Option<(u64, u64)> {
        if from >= self.total_length {
            return None;
        }

        if self.piece_length == 0 {
            let beg = self.bitfield.find_unset(from as usize)? as u64;
            let end = self
                .bitfield
                .find_set(beg as usize)
                .map(|i| i as u64)
                .unwrap_or(self.total_length);
            return Some((beg, end));
        }

        let plen = self.piece_length as u64;
        let mut pos = from;
        while pos < self.total_length {
            let index = (pos / plen) as u32;
            if self.bitfield.get(index as usize) {
                pos = (index as u64 + 1) * plen;
                continue;
            }

            let piece_start = index as u64 * plen;
            let piece_len = self.piece_len_at(index) as u64;
            match self.pieces.find(index) {
                Some(piece) => {
                    let offset = (pos - piece_start) as usize;
                    match piece.bitset.find_unset(offset) {
                        Some(gap) => {
                            let beg = piece_start + gap as u64;
                            let end = piece_start
                                + piece
                                    .bitset
                                    .find_set(gap)
                                    .map(|i| i as u64)
                                    .unwrap_or(piece_len);
                            return Some((beg, end));
                        }
                        // written from here to the piece boundary
                        None => pos = piece_start + piece_len,
                    }
                }
                None => {
                    let count = self.piece_count();
                    let mut next = index + 1;
                    while next < count
                        && !self.bitfield.get(next as usize)
                        && self.pieces.find(next).is_none()
                    {
                        next += 1;
                    }
                    let end = (next as u64 * plen).min(self.total_length);
                    return Some((pos, end));
                }
            }
        }
        None
    }

    /// Records that `[beg, end)` has been written. Returns the number of
    /// bytes that were not already marked complete, so overlapping
    /// reports from separate connections are never double-counted.
    /// Each spanned piece is handled independently; a piece whose bitset
    /// saturates is promoted into the global bitfield.
    pub fn fill(&mut self, beg: u64, end: u64) -> Result<u64> {
        if beg > end || end > self.total_length {
            return Err(RangeError {
                first: beg,
                last: end,
                limit: self.total_length,
            }
            .into());
        }
        if beg == end {
            return Ok(0);
        }

        if self.piece_length == 0 {
            let newly = self.bitfield.set_range(beg as usize, (end - 1) as usize)?;
            return Ok(newly as u64);
        }

        let plen = self.piece_length as u64;
        let first = (beg / plen) as u32;
        let last = ((end - 1) / plen) as u32;
        let mut newly = 0u64;

        for index in first..=last {
            if self.bitfield.get(index as usize) {
                continue;
            }

            let piece_start = index as u64 * plen;
            let piece_len = self.piece_len_at(index) as u64;
            let sub_beg = beg.max(piece_start) - piece_start;
            let sub_end = end.min(piece_start + piece_len) - piece_start;

            if sub_beg == 0 && sub_end == piece_len {
                // whole piece covered in one call; credit any bytes a
                // prior partial record had already counted
                let already = self
                    .pieces
                    .remove(index)
                    .map(|p| p.bitset.count_set() as u64)
                    .unwrap_or(0);
                self.bitfield.set(index as usize);
                newly += piece_len - already;
                trace!(piece = index, "piece complete");
                continue;
            }

            let piece = self.pieces.realloc_or_create(index, piece_len as u32);
            newly += piece.bitset.set_range(sub_beg as usize, sub_end as usize - 1)? as u64;
            if piece.is_saturated() {
                self.pieces.remove(index);
                self.bitfield.set(index as usize);
                trace!(piece = index, "partial piece promoted");
            }
        }

        Ok(newly)
    }

    /// Confirmed-complete bytes, counted from the global bitfield. A set
    /// final short piece contributes only its real length.
    pub fn completed(&self) -> u64 {
        if self.piece_length == 0 {
            return self.bitfield.count_set() as u64;
        }
        let plen = self.piece_length as u64;
        let mut bytes = self.bitfield.count_set() as u64 * plen;
        let count = self.piece_count();
        if count > 0 && self.bitfield.get(count as usize - 1) {
            let tail = self.total_length % plen;
            if tail > 0 {
                bytes -= plen - tail;
            }
        }
        bytes
    }

    pub fn remaining(&self) -> u64 {
        self.total_length - self.completed()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.total_length
    }

    /// Full reset: everything reverts to not-downloaded.
    pub fn clear(&mut self) {
        self.bitfield.clear();
        self.pieces.clear();
        self.uploaded_length = 0;
    }

    pub fn find_piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.find(index)
    }

    /// Direct insertion for re-check tooling. Index order and uniqueness
    /// are enforced by the table.
    pub fn insert_piece(&mut self, piece: Piece) -> Result<()> {
        self.pieces.insert(piece)
    }

    /// Fetch-or-create the partial record for `index`, sized for a
    /// possibly short final piece.
    pub fn realloc_piece(&mut self, index: u32) -> Result<&mut Piece> {
        let count = self.piece_count();
        if index >= count {
            return Err(RangeError {
                first: index as u64,
                last: index as u64,
                limit: count as u64,
            }
            .into());
        }
        let length = self.piece_len_at(index);
        Ok(self.pieces.realloc_or_create(index, length))
    }

    pub fn partial_piece_count(&self) -> usize {
        self.pieces.len()
    }
}
