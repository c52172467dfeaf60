//! Binary control-file codec. Fixed layout, all integers big-endian:
//!
//! ```text
//! version:u16  ext_flags:u32
//! identity_len:u32  identity:[u8]
//! piece_len:u32  total_len:u64  uploaded_len:u64
//! bitfield_len:u32  bitfield:[u8]
//! repeated until EOF:
//!   piece_index:u32  piece_length:u32  bitfield_len:u32  bitfield:[u8]
//! ```
//!
//! Saves are atomic (temp file + rename); a crash mid-save never
//! corrupts a previously valid file. Loads validate every declared size
//! against sizes recomputed from the header before allocating.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use limpet_util::bitset::Bitset;
use tracing::{debug, warn};

use crate::control::{piece_len, unit_count, ControlError, ControlState, Result, CONTROL_VERSION};
use crate::piece::{Piece, PieceTable};

pub const CONTROL_FILE_EXT: &str = "limpet";

const MAX_IDENTITY_LEN: usize = 1024;
const MAX_FILE_LEN: u64 = 64 * 1024 * 1024;
const MAX_TOTAL_LEN: u64 = 1 << 44; // 16 TiB

/// Sidecar control-file path for a download target,
/// `<target>.limpet` alongside the data file.
pub fn control_file_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(CONTROL_FILE_EXT);
    PathBuf::from(name)
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Reader { input, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| ControlError::Format("truncated control file".to_string()))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn at_end(&self) -> bool {
        self.pos == self.input.len()
    }
}

impl ControlState {
    /// Serializes to `path` atomically: written to a temp file, synced,
    /// then renamed over the destination.
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.ext_flags.to_be_bytes());
        buf.extend_from_slice(&(self.identity.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.identity);
        buf.extend_from_slice(&self.piece_length.to_be_bytes());
        buf.extend_from_slice(&self.total_length.to_be_bytes());
        buf.extend_from_slice(&self.uploaded_length.to_be_bytes());
        let bits = self.bitfield.as_bytes();
        buf.extend_from_slice(&(bits.len() as u32).to_be_bytes());
        buf.extend_from_slice(bits);
        for piece in self.pieces.iter() {
            buf.extend_from_slice(&piece.index.to_be_bytes());
            buf.extend_from_slice(&piece.length.to_be_bytes());
            let sub = piece.bitset.as_bytes();
            buf.extend_from_slice(&(sub.len() as u32).to_be_bytes());
            buf.extend_from_slice(sub);
        }

        let mut temp = path.to_path_buf();
        temp.set_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp, path)?;
        debug!(
            path = %path.display(),
            partial_pieces = self.pieces.len(),
            "control file saved"
        );
        Ok(())
    }

    /// Parses a control file. Truncation, a bad version, or any
    /// declared size inconsistent with the header is a `Format` error;
    /// the resulting state always satisfies the structural invariants
    /// (partial pieces only in the table, no piece both complete and
    /// partial).
    pub fn load(path: &Path) -> Result<ControlState> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_FILE_LEN {
            return Err(ControlError::Format(format!(
                "control file too large: {} bytes",
                meta.len()
            )));
        }
        let input = std::fs::read(path)?;
        let mut r = Reader::new(&input);

        let version = r.u16()?;
        if version != CONTROL_VERSION {
            return Err(ControlError::Format(format!(
                "unsupported version {} (expected {})",
                version, CONTROL_VERSION
            )));
        }
        let ext_flags = r.u32()?;

        let identity_len = r.u32()? as usize;
        if identity_len > MAX_IDENTITY_LEN {
            return Err(ControlError::Format(format!(
                "identity length too large: {}",
                identity_len
            )));
        }
        let identity = r.take(identity_len)?.to_vec();

        let piece_length = r.u32()?;
        let total_length = r.u64()?;
        let uploaded_length = r.u64()?;

        // declared sizes feed unit arithmetic below; reject absurd
        // values before trusting them
        if total_length > MAX_TOTAL_LEN {
            return Err(ControlError::Format(format!(
                "total length {} exceeds supported maximum",
                total_length
            )));
        }

        let units = unit_count(piece_length, total_length);
        let expected_bitfield = (units + 7) / 8;
        let bitfield_len = r.u32()? as usize;
        if bitfield_len != expected_bitfield {
            return Err(ControlError::Format(format!(
                "bitfield length {} does not match {} units",
                bitfield_len, units
            )));
        }
        let mut bitfield = Bitset::from_bytes(r.take(bitfield_len)?, units);

        let piece_count = if piece_length == 0 { 0 } else { units as u32 };
        let mut pieces = PieceTable::new();

        while !r.at_end() {
            let index = r.u32()?;
            let length = r.u32()?;
            let sub_len = r.u32()? as usize;

            if piece_length == 0 {
                return Err(ControlError::Format(
                    "piece entry present but piece length is zero".to_string(),
                ));
            }
            if index >= piece_count {
                return Err(ControlError::Format(format!(
                    "piece index {} out of range (count {})",
                    index, piece_count
                )));
            }
            let expected_len = piece_len(piece_length, total_length, index, piece_count);
            if length != expected_len {
                return Err(ControlError::Format(format!(
                    "piece {} length {} does not match expected {}",
                    index, length, expected_len
                )));
            }
            if sub_len != (length as usize + 7) / 8 {
                return Err(ControlError::Format(format!(
                    "piece {} bitfield length {} inconsistent with length {}",
                    index, sub_len, length
                )));
            }
            if bitfield.get(index as usize) {
                return Err(ControlError::Format(format!(
                    "piece {} is both complete and partial",
                    index
                )));
            }
            if pieces.find(index).is_some() {
                return Err(ControlError::Format(format!(
                    "duplicate piece entry {}",
                    index
                )));
            }

            let sub = Bitset::from_bytes(r.take(sub_len)?, length as usize);
            if sub.is_full() {
                // a saturated entry should have been promoted before the
                // save; restore the invariant here
                bitfield.set(index as usize);
                debug!(piece = index, "promoted saturated piece entry on load");
                continue;
            }
            if sub.count_set() == 0 {
                continue;
            }
            pieces.insert(Piece {
                index,
                length,
                bitset: sub,
            })?;
        }

        debug!(
            path = %path.display(),
            total_length,
            partial_pieces = pieces.len(),
            "control file loaded"
        );

        Ok(ControlState {
            version,
            ext_flags,
            identity,
            piece_length,
            total_length,
            uploaded_length,
            bitfield,
            pieces,
        })
    }

    /// Resume if `path` holds a control file matching this download,
    /// otherwise start fresh. A missing, foreign, or corrupt file is
    /// never an error: the download just restarts from zero.
    pub fn load_or_new(
        path: &Path,
        identity: Vec<u8>,
        piece_length: u32,
        total_length: u64,
    ) -> ControlState {
        match ControlState::load(path) {
            Ok(state) => {
                if state.identity == identity
                    && state.piece_length == piece_length
                    && state.total_length == total_length
                {
                    return state;
                }
                warn!(
                    path = %path.display(),
                    "control file belongs to a different download, starting fresh"
                );
            }
            Err(ControlError::Io(err)) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to load control file, starting fresh"
                );
            }
        }
        ControlState::new(identity, piece_length, total_length)
    }
}
