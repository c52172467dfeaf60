use limpet_util::bitset::Bitset;

use crate::control::{ControlError, Result};

/// One partially downloaded piece: byte-granular completion bitset over
/// the piece's own range. Fully complete pieces have no record here,
/// they live in the control state's global bitfield.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub length: u32,
    pub bitset: Bitset,
}

impl Piece {
    pub fn new(index: u32, length: u32) -> Self {
        Piece {
            index,
            length,
            bitset: Bitset::new(length as usize),
        }
    }

    /// Every byte of the piece is marked written.
    pub fn is_saturated(&self) -> bool {
        self.bitset.is_full()
    }
}

/// Partial pieces ordered by index. Downloads usually proceed
/// front-to-back, so lookups and inserts cluster at the most recently
/// touched slot; a cached hint makes that path cheap before falling
/// back to binary search.
#[derive(Clone, Debug, Default)]
pub struct PieceTable {
    entries: Vec<Piece>,
    hint: usize,
}

// The hint is a lookup accelerator, not state: two tables with the same
// entries are the same table.
impl PartialEq for PieceTable {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for PieceTable {}

impl PieceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, index: u32) -> Option<usize> {
        match self.entries.get(self.hint) {
            Some(piece) if piece.index == index => Some(self.hint),
            _ => self
                .entries
                .binary_search_by_key(&index, |p| p.index)
                .ok(),
        }
    }

    pub fn find(&self, index: u32) -> Option<&Piece> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    pub fn find_mut(&mut self, index: u32) -> Option<&mut Piece> {
        let pos = self.position(index)?;
        self.hint = pos;
        Some(&mut self.entries[pos])
    }

    /// Inserts preserving index order. Appending past the current tail
    /// (the sequential-download case) skips the search entirely.
    pub fn insert(&mut self, piece: Piece) -> Result<()> {
        let pos = match self.entries.last() {
            None => 0,
            Some(last) if last.index < piece.index => self.entries.len(),
            _ => match self.entries.binary_search_by_key(&piece.index, |p| p.index) {
                Ok(_) => return Err(ControlError::DuplicatePiece(piece.index)),
                Err(pos) => pos,
            },
        };
        self.entries.insert(pos, piece);
        self.hint = pos;
        Ok(())
    }

    /// Existing record for `index`, or a freshly inserted empty one of
    /// the given `length` (the caller accounts for a short final piece).
    pub fn realloc_or_create(&mut self, index: u32, length: u32) -> &mut Piece {
        if let Some(pos) = self.position(index) {
            self.hint = pos;
            return &mut self.entries[pos];
        }
        let pos = self.entries.partition_point(|p| p.index < index);
        self.entries.insert(pos, Piece::new(index, length));
        self.hint = pos;
        &mut self.entries[pos]
    }

    pub fn remove(&mut self, index: u32) -> Option<Piece> {
        let pos = self.position(index)?;
        let piece = self.entries.remove(pos);
        if self.hint >= pos && self.hint > 0 {
            self.hint -= 1;
        }
        Some(piece)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hint = 0;
    }
}
